//! `multipart/form-data` request bodies.

use std::{borrow::Cow, fmt, path::PathBuf};

use bytes::Bytes;
use mime::Mime;

use crate::util::fast_random;

/// A multipart form, built part by part.
///
/// Text and file parts only, so a form can be re-streamed for retries and
/// redirects. For fully streaming uploads use a chunk-stream request.
#[derive(Clone)]
pub struct Form {
    boundary: String,
    parts: Vec<Part>,
}

impl Form {
    /// Creates a new `Form` with a random boundary.
    pub fn new() -> Form {
        Form {
            boundary: gen_boundary(),
            parts: Vec::new(),
        }
    }

    /// Get the boundary that this form will use.
    #[inline]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Add a text attribute.
    pub fn text<N, V>(mut self, name: N, value: V) -> Form
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        self.parts.push(Part::text(value).with_name(name));
        self
    }

    /// Add a file part streamed from disk at write time.
    pub fn file<N>(mut self, name: N, path: impl Into<PathBuf>) -> Form
    where
        N: Into<Cow<'static, str>>,
    {
        self.parts.push(Part::file(path).with_name(name));
        self
    }

    /// Add a customized part.
    pub fn part<N>(mut self, name: N, part: Part) -> Form
    where
        N: Into<Cow<'static, str>>,
    {
        self.parts.push(part.with_name(name));
        self
    }

    /// The value for the `Content-Type` header.
    pub(crate) fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub(crate) fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// The `--boundary` + part-header block preceding one part's payload.
    pub(crate) fn part_head(&self, part: &Part) -> String {
        let mut head = format!("--{}\r\n", self.boundary);
        head.push_str("Content-Disposition: form-data");
        if let Some(name) = &part.name {
            head.push_str(&format!("; name=\"{name}\""));
        }
        if let Some(file_name) = &part.file_name {
            head.push_str(&format!("; filename=\"{file_name}\""));
        }
        head.push_str("\r\n");
        if let Some(mime) = &part.mime {
            head.push_str(&format!("Content-Type: {mime}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    /// The closing `--boundary--` delimiter.
    pub(crate) fn closing(&self) -> String {
        format!("--{}--\r\n", self.boundary)
    }
}

impl Default for Form {
    fn default() -> Self {
        Form::new()
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Form")
            .field("boundary", &self.boundary)
            .field("parts", &self.parts)
            .finish()
    }
}

/// A field in a multipart form.
#[derive(Clone)]
pub struct Part {
    name: Option<Cow<'static, str>>,
    file_name: Option<Cow<'static, str>>,
    mime: Option<Mime>,
    pub(crate) payload: Payload,
}

#[derive(Clone)]
pub(crate) enum Payload {
    Bytes(Bytes),
    File(PathBuf),
}

impl Part {
    /// A text part.
    pub fn text<V>(value: V) -> Part
    where
        V: Into<Cow<'static, str>>,
    {
        let value = match value.into() {
            Cow::Borrowed(s) => Bytes::from_static(s.as_bytes()),
            Cow::Owned(s) => Bytes::from(s),
        };
        Part {
            name: None,
            file_name: None,
            mime: None,
            payload: Payload::Bytes(value),
        }
    }

    /// A part with raw bytes.
    pub fn bytes(value: impl Into<Bytes>) -> Part {
        Part {
            name: None,
            file_name: None,
            mime: None,
            payload: Payload::Bytes(value.into()),
        }
    }

    /// A part streamed from a file on disk; the mime type and file name are
    /// guessed from the path.
    pub fn file(path: impl Into<PathBuf>) -> Part {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| Cow::Owned(n.to_string_lossy().into_owned()));
        let mime = Some(mime_guess::from_path(&path).first_or_octet_stream());
        Part {
            name: None,
            file_name,
            mime,
            payload: Payload::File(path),
        }
    }

    /// Override the mime type of this part.
    pub fn mime(mut self, mime: Mime) -> Part {
        self.mime = Some(mime);
        self
    }

    /// Override the file name of this part.
    pub fn file_name<V>(mut self, file_name: V) -> Part
    where
        V: Into<Cow<'static, str>>,
    {
        self.file_name = Some(file_name.into());
        self
    }

    fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Part {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Part")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .finish()
    }
}

fn gen_boundary() -> String {
    format!(
        "{:016x}-{:016x}-{:016x}-{:016x}",
        fast_random(),
        fast_random(),
        fast_random(),
        fast_random()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_head_includes_disposition() {
        let form = Form::new().text("foo", "bar");
        let head = form.part_head(&form.parts()[0]);
        assert!(head.starts_with(&format!("--{}\r\n", form.boundary())));
        assert!(head.contains("Content-Disposition: form-data; name=\"foo\""));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn file_part_guesses_mime_and_name() {
        let form = Form::new().file("report", "/tmp/data.json");
        let head = form.part_head(&form.parts()[0]);
        assert!(head.contains("filename=\"data.json\""));
        assert!(head.contains("Content-Type: application/json"));
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(Form::new().boundary(), Form::new().boundary());
    }
}
