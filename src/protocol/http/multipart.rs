//! `multipart/form-data` bodies.
//!
//! Parsing is best effort: the first section that does not look like a form
//! part ends the scan and whatever was decoded before it is kept.

use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::error::ProtocolError;

/// Upload status, numbered like the classic CGI upload error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    Ok = 0,
    NoTmpDir = 6,
    CantWrite = 7,
}

impl UploadError {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// A file part written to the upload directory.
///
/// The temporary file is removed when the value is dropped unless it was
/// moved somewhere with [`move_to`](Self::move_to).
pub struct UploadedFile {
    key: String,
    client_filename: String,
    client_media_type: Option<String>,
    size: usize,
    error: UploadError,
    tmp: RefCell<Option<TempPath>>,
}

impl UploadedFile {
    /// Form field name the file was sent under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn client_filename(&self) -> &str {
        &self.client_filename
    }

    pub fn client_media_type(&self) -> Option<&str> {
        self.client_media_type.as_deref()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn error(&self) -> UploadError {
        self.error
    }

    /// Current location of the temporary file.
    pub fn path(&self) -> Option<PathBuf> {
        self.tmp.borrow().as_ref().map(|p| p.to_path_buf())
    }

    pub fn contents(&self) -> io::Result<Vec<u8>> {
        match self.path() {
            Some(path) => fs::read(path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "uploaded file was already moved",
            )),
        }
    }

    /// Moves the upload to `target`. Works once.
    pub fn move_to(&self, target: impl AsRef<Path>) -> io::Result<()> {
        let target = target.as_ref();
        let tmp = self.tmp.borrow_mut().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "uploaded file was already moved")
        })?;
        match tmp.persist(target) {
            Ok(()) => Ok(()),
            Err(e) => {
                // rename fails across filesystems
                let tmp = e.path;
                fs::copy(&tmp, target)?;
                drop(tmp);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedFile")
            .field("key", &self.key)
            .field("client_filename", &self.client_filename)
            .field("client_media_type", &self.client_media_type)
            .field("size", &self.size)
            .field("error", &self.error)
            .field("path", &self.path())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct FormData {
    pub fields: Vec<(String, String)>,
    pub files: Vec<UploadedFile>,
}

/// Extracts the boundary from a `multipart/form-data; boundary=...` value.
pub fn boundary(content_type: &str) -> Result<String, ProtocolError> {
    let params = content_type.split_once(';').map(|(_, p)| p).unwrap_or("");
    let boundary = params
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))
        .ok_or(ProtocolError::MissingBoundary)?;
    let boundary = boundary.trim_matches('"');
    if boundary.is_empty() {
        return Err(ProtocolError::EmptyBoundary);
    }
    Ok(boundary.to_string())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `name="x"; filename="y"` parameters of a Content-Disposition value.
fn disposition_params(value: &str) -> Option<(Option<String>, Option<String>)> {
    let mut parts = value.split(';');
    if !parts.next()?.trim().eq_ignore_ascii_case("form-data") {
        return None;
    }
    let mut name = None;
    let mut filename = None;
    for part in parts {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        let val = val.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(val),
            "filename" => filename = Some(val),
            _ => {}
        }
    }
    Some((name, filename))
}

fn store(upload_dir: &Path, content: &[u8]) -> (Option<TempPath>, UploadError) {
    if !upload_dir.is_dir() {
        return (None, UploadError::NoTmpDir);
    }
    let written = tempfile::Builder::new()
        .prefix("mill.upload.")
        .tempfile_in(upload_dir)
        .and_then(|mut file| {
            file.write_all(content)?;
            file.flush()?;
            Ok(file.into_temp_path())
        });
    match written {
        Ok(path) => (Some(path), UploadError::Ok),
        Err(_) => (None, UploadError::CantWrite),
    }
}

/// Splits a multipart body into fields and files. File parts past
/// `max_files` are skipped; parsing stops at the first malformed section.
pub fn parse_form_data(boundary: &str, body: &[u8], max_files: usize, upload_dir: &Path) -> FormData {
    let delimiter = format!("--{}", boundary);
    let separator = format!("\r\n--{}", boundary);
    let mut form = FormData::default();

    if !body.starts_with(delimiter.as_bytes()) {
        return form;
    }
    let mut offset = delimiter.len() + 2;

    loop {
        let Some(section_end) = find(body, separator.as_bytes(), offset) else {
            break;
        };
        let Some(head_end) = find(body, b"\r\n\r\n", offset) else {
            break;
        };
        if head_end + 4 > section_end {
            break;
        }

        let head = String::from_utf8_lossy(&body[offset..head_end]);
        let content = &body[head_end + 4..section_end];

        let mut disposition = None;
        let mut media_type = None;
        for line in head.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "content-disposition" => disposition = disposition_params(value.trim()),
                "content-type" => media_type = Some(value.trim().to_string()),
                _ => {}
            }
        }
        let Some((Some(name), filename)) = disposition else {
            break;
        };

        match filename {
            Some(_) if form.files.len() >= max_files => {}
            Some(filename) => {
                let (tmp, error) = store(upload_dir, content);
                form.files.push(UploadedFile {
                    key: name,
                    client_filename: filename,
                    client_media_type: media_type,
                    size: content.len(),
                    error,
                    tmp: RefCell::new(tmp),
                });
            }
            None => form
                .fields
                .push((name, String::from_utf8_lossy(content).into_owned())),
        }

        offset = section_end + separator.len();
        if body[offset..].starts_with(b"--") {
            break;
        }
        offset += 2;
    }
    form
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XyZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"title\"\r\n\r\n");
        body.extend_from_slice(b"hello world\r\n");
        body.extend_from_slice(b"--XyZ\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: text/plain\r\n\r\n");
        body.extend_from_slice(b"file\r\nbody\r\n");
        body.extend_from_slice(b"--XyZ--\r\n");
        body
    }

    #[test]
    fn test_boundary_extraction() {
        assert_eq!(boundary("multipart/form-data; boundary=abc").unwrap(), "abc");
        assert_eq!(
            boundary("multipart/form-data; charset=utf-8; boundary=\"q\"").unwrap(),
            "q"
        );
        assert_eq!(
            boundary("multipart/form-data").unwrap_err(),
            ProtocolError::MissingBoundary
        );
        assert_eq!(
            boundary("multipart/form-data; boundary=").unwrap_err(),
            ProtocolError::EmptyBoundary
        );
    }

    #[test]
    fn test_fields_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let form = parse_form_data("XyZ", &sample_body(), 16, dir.path());

        assert_eq!(form.fields, vec![("title".to_string(), "hello world".to_string())]);
        assert_eq!(form.files.len(), 1);
        let file = &form.files[0];
        assert_eq!(file.key(), "doc");
        assert_eq!(file.client_filename(), "a.txt");
        assert_eq!(file.client_media_type(), Some("text/plain"));
        assert_eq!(file.error(), UploadError::Ok);
        assert_eq!(file.size(), 10);
        assert_eq!(file.contents().unwrap(), b"file\r\nbody");

        let target = dir.path().join("kept.txt");
        file.move_to(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"file\r\nbody");
        assert!(file.move_to(&target).is_err());
    }

    #[test]
    fn test_file_limit_and_missing_dir() {
        let form = parse_form_data("XyZ", &sample_body(), 0, Path::new("/tmp"));
        assert!(form.files.is_empty());
        assert_eq!(form.fields, vec![("title".to_string(), "hello world".to_string())]);

        let form = parse_form_data("XyZ", &sample_body(), 4, Path::new("/definitely/not/here"));
        assert_eq!(form.files[0].error(), UploadError::NoTmpDir);
        assert!(form.files[0].path().is_none());
    }

    #[test]
    fn test_fields_after_file_limit_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = Vec::new();
        for (name, file) in [("a", Some("1.txt")), ("b", Some("2.txt")), ("note", None)] {
            body.extend_from_slice(b"--XyZ\r\n");
            let disposition = match file {
                Some(file) => format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                    name, file
                ),
                None => format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(b"data\r\n");
        }
        body.extend_from_slice(b"--XyZ--\r\n");

        let form = parse_form_data("XyZ", &body, 1, dir.path());
        assert_eq!(form.files.len(), 1);
        assert_eq!(form.files[0].key(), "a");
        assert_eq!(form.fields, vec![("note".to_string(), "data".to_string())]);
    }

    #[test]
    fn test_malformed_section_stops_scan() {
        let body = b"--b\r\nContent-Disposition: attachment; name=\"x\"\r\n\r\n1\r\n--b--\r\n";
        let form = parse_form_data("b", body, 4, Path::new("/tmp"));
        assert!(form.fields.is_empty());

        let form = parse_form_data("other", body, 4, Path::new("/tmp"));
        assert!(form.fields.is_empty());
    }
}
