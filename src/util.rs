use http::{
    header::{Entry, HeaderMap, HeaderValue, OccupiedEntry},
    Uri,
};

pub(crate) fn basic_auth<U, P>(username: U, password: Option<P>) -> HeaderValue
where
    U: std::fmt::Display,
    P: std::fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

// xor-shift
pub(crate) fn fast_random() -> u64 {
    use std::cell::Cell;
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::num::Wrapping;

    thread_local! {
        static RNG: Cell<Wrapping<u64>> = Cell::new(Wrapping(seed()));
    }

    fn seed() -> u64 {
        let seed = RandomState::new();

        let mut out = 0;
        let mut cnt = 0;
        while out == 0 {
            cnt += 1;
            let mut hasher = seed.build_hasher();
            hasher.write_usize(cnt);
            out = hasher.finish();
        }
        out
    }

    RNG.with(|rng| {
        let mut n = rng.get();
        debug_assert_ne!(n.0, 0);
        n ^= n >> 12;
        n ^= n << 25;
        n ^= n >> 27;
        rng.set(n);
        n.0.wrapping_mul(0x2545_f491_4f6c_dd1d)
    })
}

pub(crate) fn replace_headers(dst: &mut HeaderMap, src: HeaderMap) {
    // IntoIter of HeaderMap yields (Option<HeaderName>, HeaderValue).
    // The first time a name is yielded, it will be Some(name), and if
    // there are more values with the same name, the next yield will be
    // None.

    let mut prev_entry: Option<OccupiedEntry<_>> = None;
    for (key, value) in src {
        match key {
            Some(key) => match dst.entry(key) {
                Entry::Occupied(mut e) => {
                    e.insert(value);
                    prev_entry = Some(e);
                }
                Entry::Vacant(e) => {
                    let e = e.insert_entry(value);
                    prev_entry = Some(e);
                }
            },
            None => match prev_entry {
                Some(ref mut entry) => {
                    entry.append(value);
                }
                None => unreachable!("HeaderMap::into_iter yielded None first"),
            },
        }
    }
}

/// Removes connection-specific headers that are illegal in HTTP/2,
/// preserving all other entries. Pseudo-headers (`:method`, `:scheme`,
/// `:path`, `:status`, `:authority`) are structural in `http` types and can
/// never appear in a `HeaderMap`, so the framing layer receives a clean set.
pub(crate) fn strip_connection_headers(headers: &mut HeaderMap) {
    use http::header;

    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
    ] {
        if headers.remove(&name).is_some() {
            log::trace!("removed illegal {name} header for http2");
        }
    }
    if headers
        .remove(http::HeaderName::from_static("keep-alive"))
        .is_some()
    {
        log::trace!("removed illegal keep-alive header for http2");
    }
}

/// Percent-encode the path and query of `uri`, leaving already-valid URI
/// characters alone. Falls back to the original on any rebuild failure.
pub(crate) fn encode_uri(uri: &Uri) -> Uri {
    use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

    // everything a conformant request target cannot carry raw
    const TARGET: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'<')
        .add(b'>')
        .add(b'`')
        .add(b'{')
        .add(b'}')
        .add(b'|')
        .add(b'\\')
        .add(b'^');

    let Some(pq) = uri.path_and_query() else {
        return uri.clone();
    };
    let encoded = utf8_percent_encode(pq.as_str(), TARGET).to_string();
    if encoded == pq.as_str() {
        return uri.clone();
    }
    let mut parts = uri.clone().into_parts();
    match encoded.parse() {
        Ok(pq) => {
            parts.path_and_query = Some(pq);
            Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
        }
        Err(_) => uri.clone(),
    }
}

/// The value for a `Host` header (HTTP/1) or `:authority` (HTTP/2): host
/// plus the port when it is not the scheme default.
pub(crate) fn authority_string(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let default_port = match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    Some(match uri.port_u16() {
        Some(port) if port != default_port => format!("{host}:{port}"),
        _ => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_omits_default_port() {
        let uri: Uri = "http://127.0.0.1/abc".parse().unwrap();
        assert_eq!(authority_string(&uri).unwrap(), "127.0.0.1");

        let uri: Uri = "http://127.0.0.1:8080/abc".parse().unwrap();
        assert_eq!(authority_string(&uri).unwrap(), "127.0.0.1:8080");

        let uri: Uri = "https://example.com:443/".parse().unwrap();
        assert_eq!(authority_string(&uri).unwrap(), "example.com");
    }

    #[test]
    fn strips_connection_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-extra", HeaderValue::from_static("1"));
        strip_connection_headers(&mut headers);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("content-type"));
        assert!(headers.contains_key("x-extra"));
    }

    #[test]
    fn fast_random_is_nonzero_and_varies() {
        let a = fast_random();
        let b = fast_random();
        assert!(a != 0);
        assert!(a != b);
    }
}
