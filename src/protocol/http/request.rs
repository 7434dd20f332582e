use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, Request, Uri, Version};

use super::multipart::UploadedFile;
use super::parser::header_line;

/// An incoming request together with everything decoded from it: query
/// parameters, form fields and uploaded files.
pub struct ServerRequest {
    request: Request<Bytes>,
    query: Vec<(String, String)>,
    parsed_body: Option<Vec<(String, String)>>,
    uploaded_files: Vec<UploadedFile>,
    server_params: HashMap<String, String>,
}

impl ServerRequest {
    pub fn new(request: Request<Bytes>, server_params: HashMap<String, String>) -> Self {
        let query = request
            .uri()
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        Self {
            request,
            query,
            parsed_body: None,
            uploaded_files: Vec::new(),
            server_params,
        }
    }

    pub(crate) fn with_parsed_body(mut self, fields: Vec<(String, String)>) -> Self {
        self.parsed_body = Some(fields);
        self
    }

    pub(crate) fn with_uploaded_files(mut self, files: Vec<UploadedFile>) -> Self {
        self.uploaded_files = files;
        self
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    pub fn version(&self) -> Version {
        self.request.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// First value of a header, if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers().get(name)?.to_str().ok()
    }

    /// Every value of a header joined with `", "`; empty when absent.
    pub fn header_line(&self, name: &str) -> String {
        header_line(self.request.headers(), name)
    }

    pub fn body(&self) -> &Bytes {
        self.request.body()
    }

    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Decoded form fields of a urlencoded or multipart POST.
    pub fn parsed_body(&self) -> Option<&[(String, String)]> {
        self.parsed_body.as_deref()
    }

    pub fn form(&self, name: &str) -> Option<&str> {
        self.parsed_body
            .as_ref()?
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn uploaded_files(&self) -> &[UploadedFile] {
        &self.uploaded_files
    }

    pub fn file(&self, key: &str) -> Option<&UploadedFile> {
        self.uploaded_files.iter().find(|f| f.key() == key)
    }

    pub fn server_params(&self) -> &HashMap<String, String> {
        &self.server_params
    }
}

impl fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequest")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("version", &self.version())
            .field("headers", self.headers())
            .field("body_len", &self.body().len())
            .field("files", &self.uploaded_files.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_decoding() {
        let request = Request::builder()
            .uri("/search?q=hello+world&lang=en&q=again&enc=%26")
            .body(Bytes::new())
            .unwrap();
        let req = ServerRequest::new(request, HashMap::new());
        assert_eq!(req.query("q"), Some("hello world"));
        assert_eq!(req.query("enc"), Some("&"));
        assert_eq!(req.query_params().len(), 4);
        assert_eq!(req.path(), "/search");
        assert!(req.parsed_body().is_none());
    }
}
