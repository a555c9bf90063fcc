use std::collections::HashMap;
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

/// Streaming content encoder used by the response writer.
pub trait Encoder: Send {
    /// Token used in `Content-Encoding`.
    fn name(&self) -> &'static str;

    /// Feeds body bytes into the encoder.
    fn compress(&mut self, data: &[u8]) -> io::Result<()>;

    /// Emits everything encoded so far, or `None` if nothing new was fed.
    fn flush(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Ends the stream and returns the trailing bytes.
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>>;
}

pub struct GzipEncoder {
    inner: GzEncoder<Vec<u8>>,
    dirty: bool,
}

impl GzipEncoder {
    pub fn new() -> Self {
        Self {
            inner: GzEncoder::new(Vec::new(), Compression::default()),
            dirty: false,
        }
    }
}

impl Default for GzipEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for GzipEncoder {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&mut self, data: &[u8]) -> io::Result<()> {
        if !data.is_empty() {
            self.inner.write_all(data)?;
            self.dirty = true;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.dirty {
            return Ok(None);
        }
        self.inner.flush()?;
        self.dirty = false;
        Ok(Some(std::mem::take(self.inner.get_mut())))
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        self.inner.finish()
    }
}

type Factory = fn() -> Box<dyn Encoder>;

fn gzip() -> Box<dyn Encoder> {
    Box::new(GzipEncoder::new())
}

/// Content codings the server can apply, by name.
pub struct EncodingRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl EncodingRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, factory: Factory) {
        self.factories.insert(name, factory);
    }

    pub fn supports(&self, name: &str) -> bool {
        self.factories.contains_key(name.to_ascii_lowercase().as_str())
    }

    /// Picks the encoder for an `Accept-Encoding` value.
    ///
    /// The registered coding with the highest `q` wins; ties go to the one
    /// listed first and `q=0` means not acceptable.
    pub fn select(&self, accept_encoding: &str) -> Option<Box<dyn Encoder>> {
        let mut best: Option<(f32, Factory)> = None;
        for entry in accept_encoding.split(',') {
            let mut parts = entry.split(';');
            let name = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
            let weight = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);

            let Some(factory) = self.factories.get(name.as_str()) else {
                continue;
            };
            if weight <= 0.0 {
                continue;
            }
            if best.is_none_or(|(w, _)| weight > w) {
                best = Some((weight, *factory));
            }
        }
        best.map(|(_, factory)| factory())
    }
}

impl Default for EncodingRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("gzip", gzip);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn gzip_flush_then_finish_round_trips() {
        let mut encoder: Box<dyn Encoder> = Box::new(GzipEncoder::new());
        let mut out = Vec::new();

        encoder.compress(b"hello ").unwrap();
        out.extend(encoder.flush().unwrap().unwrap());
        assert!(encoder.flush().unwrap().is_none());
        encoder.compress(b"world").unwrap();
        out.extend(encoder.finish().unwrap());

        let mut plain = String::new();
        GzDecoder::new(&out[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "hello world");
    }

    #[test]
    fn selects_registered_coding() {
        let registry = EncodingRegistry::default();
        assert_eq!(registry.select("gzip").unwrap().name(), "gzip");
        assert_eq!(registry.select("br, GZIP;q=0.5").unwrap().name(), "gzip");
        assert!(registry.select("br, deflate").is_none());
        assert!(registry.select("").is_none());
    }

    #[test]
    fn zero_weight_is_refused() {
        let registry = EncodingRegistry::default();
        assert!(registry.select("gzip;q=0").is_none());
        assert!(registry.select("gzip; q=0.0, identity").is_none());
    }

    #[test]
    fn higher_weight_wins() {
        fn other() -> Box<dyn Encoder> {
            struct Other;
            impl Encoder for Other {
                fn name(&self) -> &'static str {
                    "other"
                }
                fn compress(&mut self, _: &[u8]) -> io::Result<()> {
                    Ok(())
                }
                fn flush(&mut self) -> io::Result<Option<Vec<u8>>> {
                    Ok(None)
                }
                fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
                    Ok(Vec::new())
                }
            }
            Box::new(Other)
        }

        let mut registry = EncodingRegistry::default();
        registry.register("other", other);

        assert_eq!(registry.select("gzip;q=0.4, other;q=0.9").unwrap().name(), "other");
        assert_eq!(registry.select("other, gzip").unwrap().name(), "other");
        assert_eq!(registry.select("gzip, other").unwrap().name(), "gzip");
    }
}
