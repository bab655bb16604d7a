use cstr_core::CStr;

use crate::error::{Error, Result};
use crate::param::{MAXPATH, NAME_MAX};

#[derive(PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - The slice contains no NUL characters and no '/'.
    // - The slice is not longer than NAME_MAX.
    inner: [u8],
}

impl FileName {
    /// # Safety
    ///
    /// `bytes` must not contain any NUL or '/' characters, and must be at
    /// most NAME_MAX bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        debug_assert!(!bytes.contains(&0) && !bytes.contains(&b'/'));
        debug_assert!(bytes.len() <= NAME_MAX);
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of
        // its attribute `#[repr(transparent)]`, and the slice satisfies the
        // invariant by the safety condition of this method.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    /// Checked constructor for names arriving from callers.
    pub fn new(bytes: &[u8]) -> Result<&Self> {
        if bytes.is_empty() || bytes.contains(&0) || bytes.contains(&b'/') {
            return Err(Error::Inval);
        }
        if bytes.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        // SAFETY: just checked.
        Ok(unsafe { Self::from_bytes(bytes) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_dot(&self) -> bool {
        &self.inner == b"."
    }

    pub fn is_dotdot(&self) -> bool {
        &self.inner == b".."
    }
}

#[derive(PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Path {
    // Invariant: the slice contains no NUL characters.
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // attribute `#[repr(transparent)]`, and a CStr's bytes contain no
        // NUL.
        unsafe { &*(cstr.to_bytes() as *const [u8] as *const Self) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // attribute `#[repr(transparent)]`, and the slice contains no NUL by
        // the safety condition of this method.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    /// Checked constructor for paths arriving from callers.
    pub fn from_str(s: &str) -> Result<&Self> {
        let bytes = s.as_bytes();
        if bytes.contains(&0) {
            return Err(Error::Inval);
        }
        if bytes.len() > MAXPATH {
            return Err(Error::NameTooLong);
        }
        // SAFETY: just checked.
        Ok(unsafe { Self::from_bytes(bytes) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns `Some((path, name))` where,
    ///  - `name` is the next path element from `self`, and
    ///  - `path` is the remaining path.
    ///
    /// The returned path has no leading slashes, so the caller can check
    /// `path.is_empty_string()` to see if the name is the last one.
    ///
    /// If no name to remove, returns `None`.
    ///
    /// A component longer than NAME_MAX fails with `NameTooLong`.
    pub fn skipelem(&self) -> Result<Option<(&Self, &FileName)>> {
        let mut bytes = &self.inner;

        let name_start = match bytes.iter().position(|ch| *ch != b'/') {
            Some(i) => i,
            None => return Ok(None),
        };
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len());
        if len > NAME_MAX {
            return Err(Error::NameTooLong);
        }

        // SAFETY: `bytes[..len]` is a subslice of `self.inner` (no NUL) that
        // stops before any '/', and its length was just checked.
        let name = unsafe { FileName::from_bytes(&bytes[..len]) };

        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or(bytes.len());

        // SAFETY: a subslice of `self.inner`, which contains no NUL.
        let path = unsafe { Self::from_bytes(&bytes[next_start..]) };
        Ok(Some((path, name)))
    }

    /// Returns `true` if `Path` begins with `'/'`.
    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}
