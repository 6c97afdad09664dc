use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

/// A typed resource location inside an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceSlot {
    pub type_name: &'static str,
    pub id: u16,
    pub locale: u16,
}

/// Slot holding the setup payload zip. The bootstrapper reads the same slot
/// when it extracts itself.
pub const SETUP_PAYLOAD: ResourceSlot = ResourceSlot {
    type_name: "DATA",
    id: 131,
    locale: 0x0409,
};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to open resources of {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },
    #[error("failed to write resource {type_name}/{id} in {}: {reason}", path.display())]
    Write {
        path: PathBuf,
        type_name: &'static str,
        id: u16,
        reason: String,
    },
    #[error("failed to commit resources of {}: {reason}", path.display())]
    Commit { path: PathBuf, reason: String },
}

/// Opens an executable's resources for editing.
pub trait ResourceEditor: Send + Sync {
    /// # Errors
    /// Returns [`ResourceError::Open`] when the binary cannot be opened for
    /// resource updates.
    fn begin(&self, binary: &Path) -> Result<Box<dyn ResourceSession>, ResourceError>;
}

/// An open edit. Changes become visible only on [`ResourceSession::commit`];
/// dropping the session without committing discards them.
pub trait ResourceSession {
    /// # Errors
    /// Returns [`ResourceError::Write`] when the slot cannot be updated.
    fn update(&mut self, slot: ResourceSlot, data: &[u8]) -> Result<(), ResourceError>;

    /// # Errors
    /// Returns [`ResourceError::Commit`] when the changes cannot be written.
    fn commit(self: Box<Self>) -> Result<(), ResourceError>;
}

/// Platform default: the Win32 resource API on Windows, the trailer store
/// elsewhere.
#[must_use]
pub fn default_editor() -> Box<dyn ResourceEditor> {
    #[cfg(windows)]
    {
        Box::new(win32::Win32ResourceEditor)
    }
    #[cfg(not(windows))]
    {
        Box::new(TrailerResourceEditor)
    }
}

const TRAILER_MAGIC: &[u8; 8] = b"RLTRSRC1";
const FOOTER_LEN: usize = 8 + 4 + TRAILER_MAGIC.len();

type SlotKey = (String, u16, u16);

/// Stores resources in a table appended after the executable image:
///
/// ```text
/// [image][entry]*[table offset: u64 LE][entry count: u32 LE]["RLTRSRC1"]
/// entry = [type len: u16][type][id: u16][locale: u16][data len: u64][data]
/// ```
///
/// Rewriting replaces any previous table, so the image itself is untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrailerResourceEditor;

impl ResourceEditor for TrailerResourceEditor {
    fn begin(&self, binary: &Path) -> Result<Box<dyn ResourceSession>, ResourceError> {
        let bytes = std::fs::read(binary).map_err(|error| ResourceError::Open {
            path: binary.to_path_buf(),
            reason: error.to_string(),
        })?;
        let (image_len, table) = parse_trailer(&bytes).ok_or_else(|| ResourceError::Open {
            path: binary.to_path_buf(),
            reason: "corrupt resource table".to_string(),
        })?;

        let mut bytes = bytes;
        bytes.truncate(image_len);
        Ok(Box::new(TrailerSession {
            path: binary.to_path_buf(),
            image: bytes,
            table,
        }))
    }
}

struct TrailerSession {
    path: PathBuf,
    image: Vec<u8>,
    table: BTreeMap<SlotKey, Vec<u8>>,
}

impl ResourceSession for TrailerSession {
    fn update(&mut self, slot: ResourceSlot, data: &[u8]) -> Result<(), ResourceError> {
        if slot.type_name.len() > usize::from(u16::MAX) {
            return Err(ResourceError::Write {
                path: self.path.clone(),
                type_name: slot.type_name,
                id: slot.id,
                reason: "type name too long".to_string(),
            });
        }
        self.table.insert(
            (slot.type_name.to_string(), slot.id, slot.locale),
            data.to_vec(),
        );
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), ResourceError> {
        let mut out = self.image;
        let table_offset = out.len() as u64;
        for ((type_name, id, locale), data) in &self.table {
            let type_len = u16::try_from(type_name.len()).unwrap_or(u16::MAX);
            out.extend_from_slice(&type_len.to_le_bytes());
            out.extend_from_slice(type_name.as_bytes());
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&locale.to_le_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(data);
        }
        let count = u32::try_from(self.table.len()).map_err(|_| ResourceError::Commit {
            path: self.path.clone(),
            reason: "too many resources".to_string(),
        })?;
        out.extend_from_slice(&table_offset.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(TRAILER_MAGIC);

        crate::fs::write_atomic(&self.path, &out).map_err(|error| ResourceError::Commit {
            path: self.path.clone(),
            reason: error.to_string(),
        })?;
        debug!(
            "Committed {} resource(s) to {}",
            self.table.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Read one slot written by [`TrailerResourceEditor`].
///
/// # Errors
/// Returns [`ResourceError::Open`] when the binary cannot be read or its
/// resource table is corrupt.
pub fn read_trailer_resource(
    binary: &Path,
    slot: ResourceSlot,
) -> Result<Option<Vec<u8>>, ResourceError> {
    let bytes = std::fs::read(binary).map_err(|error| ResourceError::Open {
        path: binary.to_path_buf(),
        reason: error.to_string(),
    })?;
    let (_, mut table) = parse_trailer(&bytes).ok_or_else(|| ResourceError::Open {
        path: binary.to_path_buf(),
        reason: "corrupt resource table".to_string(),
    })?;
    Ok(table.remove(&(slot.type_name.to_string(), slot.id, slot.locale)))
}

/// Split a file into its image length and resource table. A file without a
/// trailer is all image. `None` means the trailer is present but damaged.
fn parse_trailer(bytes: &[u8]) -> Option<(usize, BTreeMap<SlotKey, Vec<u8>>)> {
    if bytes.len() < FOOTER_LEN || !bytes.ends_with(TRAILER_MAGIC) {
        return Some((bytes.len(), BTreeMap::new()));
    }

    let footer = &bytes[bytes.len() - FOOTER_LEN..];
    let table_offset = usize::try_from(u64::from_le_bytes(footer[..8].try_into().ok()?)).ok()?;
    let count = u32::from_le_bytes(footer[8..12].try_into().ok()?);
    let table_end = bytes.len() - FOOTER_LEN;
    if table_offset > table_end {
        return None;
    }

    let mut cursor = Cursor {
        data: &bytes[table_offset..table_end],
    };
    let mut table = BTreeMap::new();
    for _ in 0..count {
        let type_len = usize::from(u16::from_le_bytes(cursor.take(2)?.try_into().ok()?));
        let type_name = String::from_utf8(cursor.take(type_len)?.to_vec()).ok()?;
        let id = u16::from_le_bytes(cursor.take(2)?.try_into().ok()?);
        let locale = u16::from_le_bytes(cursor.take(2)?.try_into().ok()?);
        let len = usize::try_from(u64::from_le_bytes(cursor.take(8)?.try_into().ok()?)).ok()?;
        let data = cursor.take(len)?.to_vec();
        table.insert((type_name, id, locale), data);
    }
    cursor.data.is_empty().then_some((table_offset, table))
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Some(head)
    }
}

#[cfg(windows)]
mod win32 {
    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    use windows_sys::Win32::System::LibraryLoader::{
        BeginUpdateResourceW, EndUpdateResourceW, UpdateResourceW,
    };

    use super::{ResourceEditor, ResourceError, ResourceSession, ResourceSlot};

    fn wide(value: &std::ffi::OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Edits the PE resource section through `BeginUpdateResourceW`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Win32ResourceEditor;

    impl ResourceEditor for Win32ResourceEditor {
        fn begin(&self, binary: &Path) -> Result<Box<dyn ResourceSession>, ResourceError> {
            let path = wide(binary.as_os_str());
            // SAFETY: `path` is a NUL-terminated UTF-16 string that outlives the call.
            let handle = unsafe { BeginUpdateResourceW(path.as_ptr(), 0) };
            if handle.is_null() {
                return Err(ResourceError::Open {
                    path: binary.to_path_buf(),
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
            Ok(Box::new(Win32Session {
                path: binary.to_path_buf(),
                handle,
                finished: false,
            }))
        }
    }

    struct Win32Session {
        path: PathBuf,
        handle: *mut c_void,
        finished: bool,
    }

    impl ResourceSession for Win32Session {
        fn update(&mut self, slot: ResourceSlot, data: &[u8]) -> Result<(), ResourceError> {
            let type_name = wide(std::ffi::OsStr::new(slot.type_name));
            let len = u32::try_from(data.len()).map_err(|_| ResourceError::Write {
                path: self.path.clone(),
                type_name: slot.type_name,
                id: slot.id,
                reason: "resource larger than 4 GiB".to_string(),
            })?;
            // SAFETY: the handle is live until `finished` is set; the integer id
            // is passed in MAKEINTRESOURCE form and `data` is valid for `len` bytes.
            let ok = unsafe {
                UpdateResourceW(
                    self.handle,
                    type_name.as_ptr(),
                    usize::from(slot.id) as *const u16,
                    slot.locale,
                    data.as_ptr().cast(),
                    len,
                )
            };
            if ok == 0 {
                return Err(ResourceError::Write {
                    path: self.path.clone(),
                    type_name: slot.type_name,
                    id: slot.id,
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
            Ok(())
        }

        fn commit(mut self: Box<Self>) -> Result<(), ResourceError> {
            self.finished = true;
            // SAFETY: the handle came from BeginUpdateResourceW and is ended once.
            let ok = unsafe { EndUpdateResourceW(self.handle, 0) };
            if ok == 0 {
                return Err(ResourceError::Commit {
                    path: self.path.clone(),
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
            Ok(())
        }
    }

    impl Drop for Win32Session {
        fn drop(&mut self) {
            if !self.finished {
                // SAFETY: discards the pending update on a handle not yet ended.
                unsafe {
                    EndUpdateResourceW(self.handle, 1);
                }
            }
        }
    }
}

#[cfg(windows)]
pub use win32::Win32ResourceEditor;

#[cfg(test)]
mod tests {
    use super::{
        ResourceEditor, ResourceSlot, SETUP_PAYLOAD, TrailerResourceEditor, read_trailer_resource,
    };

    const ICON_SLOT: ResourceSlot = ResourceSlot {
        type_name: "ICON",
        id: 1,
        locale: 0,
    };

    #[test]
    fn committed_resources_are_readable_and_image_is_preserved() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let binary = temp.path().join("Setup.exe");
        std::fs::write(&binary, b"MZ fake image").expect("image written");

        let mut session = TrailerResourceEditor.begin(&binary).expect("begin");
        session
            .update(SETUP_PAYLOAD, b"zip bytes")
            .expect("update payload");
        session.update(ICON_SLOT, b"icon").expect("update icon");
        session.commit().expect("commit");

        assert!(
            std::fs::read(&binary)
                .expect("binary readable")
                .starts_with(b"MZ fake image")
        );
        assert_eq!(
            read_trailer_resource(&binary, SETUP_PAYLOAD).expect("read"),
            Some(b"zip bytes".to_vec())
        );
        assert_eq!(
            read_trailer_resource(&binary, ICON_SLOT).expect("read"),
            Some(b"icon".to_vec())
        );
    }

    #[test]
    fn rewriting_a_slot_replaces_previous_content() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let binary = temp.path().join("Setup.exe");
        std::fs::write(&binary, b"image").expect("image written");

        for payload in [&b"first payload"[..], &b"second"[..]] {
            let mut session = TrailerResourceEditor.begin(&binary).expect("begin");
            session.update(SETUP_PAYLOAD, payload).expect("update");
            session.commit().expect("commit");
        }

        assert_eq!(
            read_trailer_resource(&binary, SETUP_PAYLOAD).expect("read"),
            Some(b"second".to_vec())
        );
        let len = std::fs::metadata(&binary).expect("metadata").len();
        assert!(len < 64, "old trailer should be replaced, file is {len} bytes");
    }

    #[test]
    fn dropping_a_session_discards_changes() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let binary = temp.path().join("Setup.exe");
        std::fs::write(&binary, b"image").expect("image written");

        {
            let mut session = TrailerResourceEditor.begin(&binary).expect("begin");
            session.update(SETUP_PAYLOAD, b"never").expect("update");
        }

        assert_eq!(std::fs::read(&binary).expect("readable"), b"image");
        assert_eq!(
            read_trailer_resource(&binary, SETUP_PAYLOAD).expect("read"),
            None
        );
    }

    #[test]
    fn missing_binary_fails_to_open() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        assert!(
            TrailerResourceEditor
                .begin(&temp.path().join("missing.exe"))
                .is_err()
        );
    }
}
