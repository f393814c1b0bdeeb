//! Tile sources for the fly-through

use globe_imagery_lib::{ImageryError, Result, RetrievalError, Texture, TileFetcher};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Reads raw RGBA8 tiles from `<root>/<resource key>.<extension>`.
pub struct FileFetcher {
    root: PathBuf,
    extension: String,
    tile_width: u32,
    tile_height: u32,
}

impl FileFetcher {
    pub fn new(root: PathBuf, extension: &str, tile_width: u32, tile_height: u32) -> Result<Self> {
        if !std::fs::metadata(&root)?.is_dir() {
            return Err(ImageryError::InvalidConfig(format!(
                "image root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            extension: extension.trim_start_matches('.').to_string(),
            tile_width,
            tile_height,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{}", self.extension))
    }
}

impl TileFetcher for FileFetcher {
    fn fetch(
        &self,
        key: &str,
    ) -> impl Future<Output = std::result::Result<Texture, RetrievalError>> + Send {
        let path = self.path_for(key);
        let (width, height) = (self.tile_width, self.tile_height);
        async move {
            let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound => RetrievalError::Status(404),
                _ => RetrievalError::from(e),
            })?;
            Texture::from_rgba(width, height, data)
        }
    }
}

/// Generates gradient tiles after a simulated latency, failing a fraction of requests.
pub struct SyntheticFetcher {
    tile_width: u32,
    tile_height: u32,
    latency: Duration,
    failure_rate: f64,
    attempts: AtomicU64,
}

impl SyntheticFetcher {
    pub fn new(tile_width: u32, tile_height: u32, latency: Duration, failure_rate: f64) -> Self {
        Self {
            tile_width,
            tile_height,
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            attempts: AtomicU64::new(0),
        }
    }

    /// Deterministic pseudo-random draw in `[0, 1)` per key and attempt
    fn roll(key: &str, attempt: u64) -> f64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        attempt.hash(&mut hasher);
        (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn render(&self, key: &str) -> Texture {
        let level = key
            .split('/')
            .nth(1)
            .and_then(|l| l.parse::<u32>().ok())
            .unwrap_or(0);
        let shade = (level * 20).min(255) as u8;

        let (w, h) = (self.tile_width.max(1), self.tile_height.max(1));
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[
                    (x * 255 / w) as u8,
                    (y * 255 / h) as u8,
                    shade,
                    255,
                ]);
            }
        }
        Texture::new(w, h, data)
    }
}

impl TileFetcher for SyntheticFetcher {
    fn fetch(
        &self,
        key: &str,
    ) -> impl Future<Output = std::result::Result<Texture, RetrievalError>> + Send {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        let result = if Self::roll(key, attempt) < self.failure_rate {
            Err(RetrievalError::Network(format!("simulated failure for {key}")))
        } else {
            Ok(self.render(key))
        };
        let latency = self.latency;
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        }
    }
}

/// Either tile source, chosen at startup
pub enum Source {
    Files(FileFetcher),
    Synthetic(SyntheticFetcher),
}

impl TileFetcher for Source {
    fn fetch(
        &self,
        key: &str,
    ) -> impl Future<Output = std::result::Result<Texture, RetrievalError>> + Send {
        async move {
            match self {
                Source::Files(f) => f.fetch(key).await,
                Source::Synthetic(s) => s.fetch(key).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_tiles_have_tile_size() {
        let fetcher = SyntheticFetcher::new(8, 4, Duration::ZERO, 0.0);
        let texture = fetcher.fetch("imagery/3/1/1_2").await.unwrap();
        assert_eq!((texture.width, texture.height), (8, 4));
        assert_eq!(texture.size_in_bytes(), 8 * 4 * 4);
        assert_eq!(texture.data[2], 60);
    }

    #[tokio::test]
    async fn test_synthetic_failure_rate() {
        let always = SyntheticFetcher::new(2, 2, Duration::ZERO, 1.0);
        assert!(matches!(
            always.fetch("imagery/0/0/0_0").await,
            Err(RetrievalError::Network(_))
        ));

        let never = SyntheticFetcher::new(2, 2, Duration::ZERO, 0.0);
        for i in 0..20 {
            assert!(never.fetch(&format!("imagery/1/0/0_{i}")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_and_reports_missing() {
        let root = std::env::temp_dir().join(format!("globe-imagery-test-{}", std::process::id()));
        std::fs::create_dir_all(root.join("imagery/0/0")).unwrap();
        std::fs::write(root.join("imagery/0/0/0_0.rgba"), vec![7u8; 16]).unwrap();
        std::fs::write(root.join("imagery/0/0/0_1.rgba"), vec![7u8; 3]).unwrap();

        let fetcher = Source::Files(FileFetcher::new(root.clone(), ".rgba", 2, 2).unwrap());
        let texture = fetcher.fetch("imagery/0/0/0_0").await.unwrap();
        assert_eq!(texture.data.as_ref(), &[7u8; 16]);

        assert!(matches!(
            fetcher.fetch("imagery/0/0/0_1").await,
            Err(RetrievalError::Decode(_))
        ));
        assert!(matches!(
            fetcher.fetch("imagery/0/0/0_9").await,
            Err(RetrievalError::Status(404))
        ));

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_file_fetcher_rejects_missing_root() {
        let missing = std::env::temp_dir().join("globe-imagery-test-does-not-exist");
        assert!(matches!(
            FileFetcher::new(missing, "rgba", 2, 2),
            Err(ImageryError::Io(_))
        ));
    }
}
