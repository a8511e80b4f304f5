use std::fs::{self, File};
use std::io::{BufReader, Cursor};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{FileRecord, FileSet, Hash32};
use crate::engine::TaskContext;
use crate::error::FileError;
use crate::tasks::settle;
use crate::utils::{glob_files, remove_dir};

const DIR_IMAGES: &str = "images";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors that can occur when compressing images.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Cache metadata error: {0}")]
    Metadata(String),
}

/// Formats that are re-encoded when compressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Lossy, at the given quality (1-100).
    Jpeg(u8),
    /// Lossless, at the best compression level.
    Png,
}

impl ImageKind {
    /// Picks the transform for a file by extension, `None` for formats that
    /// are copied as they are.
    pub fn detect(path: &Utf8Path, quality: u8) -> Option<Self> {
        match path.extension()?.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg(quality.clamp(1, 100))),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ImageKind::Jpeg(_) => "jpg",
            ImageKind::Png => "png",
        }
    }

    /// Describes the transform, part of the cache key.
    fn describe(&self) -> String {
        match self {
            ImageKind::Jpeg(q) => format!("jpeg-q{q}"),
            ImageKind::Png => "png-best".to_string(),
        }
    }

    fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>, ImageError> {
        let img = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()?;

        let (width, height) = (img.width(), img.height());
        let mut buffer = Vec::new();

        match *self {
            ImageKind::Jpeg(quality) => {
                let rgb = img.to_rgb8();
                JpegEncoder::new_with_quality(&mut buffer, quality).write_image(
                    &rgb,
                    width,
                    height,
                    ExtendedColorType::Rgb8,
                )?;
            }
            ImageKind::Png => {
                let color: ExtendedColorType = img.color().into();
                PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, FilterType::Adaptive)
                    .write_image(img.as_bytes(), width, height, color)?;
            }
        }

        Ok(buffer)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    original: u64,
    compressed: u64,
}

/// Result of a compression request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    /// The result came from the cache.
    pub hit: bool,
}

/// Content-addressed store of compressed images.
///
/// Entries are keyed by the hash of the source bytes together with the
/// transform description, so changing the quality invalidates them.
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: Utf8PathBuf,
}

impl ImageCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Returns the smaller of `bytes` and its re-encoded form.
    pub fn compress(&self, bytes: &[u8], kind: ImageKind) -> Result<Compressed, ImageError> {
        let key = Hash32::hash_with(bytes, &kind.describe()).to_hex();
        let path_data = self.dir.join(format!("{key}.{}", kind.extension()));
        let path_meta = self.dir.join(format!("{key}.meta.cbor"));

        if path_data.exists() && path_meta.exists() {
            let file = BufReader::new(File::open(&path_meta)?);
            if let Ok(meta) = ciborium::from_reader::<CacheMetadata, _>(file) {
                let cached = fs::read(&path_data)?;
                if cached.len() as u64 == meta.compressed {
                    return Ok(Compressed {
                        bytes: cached,
                        hit: true,
                    });
                }
            }
        }

        let original = bytes.len() as u64;
        let encoded = kind.encode(bytes)?;
        let bytes = if encoded.len() < bytes.len() {
            encoded
        } else {
            bytes.to_vec()
        };

        fs::create_dir_all(&self.dir)?;
        write_atomic(&path_data, &bytes)?;

        let meta = CacheMetadata {
            original,
            compressed: bytes.len() as u64,
        };
        let mut buffer = Vec::new();
        ciborium::into_writer(&meta, &mut buffer).map_err(|e| ImageError::Metadata(e.to_string()))?;
        write_atomic(&path_meta, &buffer)?;

        Ok(Compressed { bytes, hit: false })
    }

    pub fn clear(&self) -> std::io::Result<bool> {
        remove_dir(&self.dir)
    }
}

/// Concurrent tasks may race on the same entry; the last rename wins and
/// both writers produce the same bytes.
fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> std::io::Result<()> {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp{}.{n}", std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

pub(crate) fn image_cache(ctx: &TaskContext<'_>) -> ImageCache {
    ImageCache::new(ctx.config().cache().join(DIR_IMAGES))
}

/// Copies the image directory to the output, compressing JPEG and PNG
/// files when compression is on.
pub(crate) fn build_images(ctx: &TaskContext<'_>) -> anyhow::Result<FileSet> {
    let config = ctx.config();
    let settings = &config.settings;
    let src = config.src();
    let cache = image_cache(ctx);

    let pattern = format!("{}/**/*", glob::Pattern::escape(&settings.image_dir));
    let entries = glob_files(&src, &pattern)?;

    let results: Vec<_> = entries
        .par_iter()
        .map(|(rel, path)| {
            let kind = ImageKind::detect(rel, settings.image_quality).filter(|_| config.compress);
            let result = match kind {
                None => Ok((FileRecord::source(rel.clone(), path.clone()), None)),
                Some(kind) => fs::read(path)
                    .map_err(ImageError::from)
                    .and_then(|bytes| cache.compress(&bytes, kind))
                    .map(|c| (FileRecord::new(rel.clone(), c.bytes), Some(c.hit))),
            };
            (path, result)
        })
        .collect();

    let mut output = FileSet::new();
    let mut errors = Vec::new();
    let mut hits = 0;
    let mut misses = 0;

    for (path, result) in results {
        match result {
            Ok((record, hit)) => {
                match hit {
                    Some(true) => hits += 1,
                    Some(false) => misses += 1,
                    None => {}
                }
                output.insert(record);
            }
            Err(e) => {
                tracing::error!(file = %path, "{e}");
                errors.push(FileError {
                    path: path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    output.write_to(&config.dist())?;
    settle(ctx, errors)?;

    if config.compress {
        tracing::info!("processed {} image(s), {hits} cached, {misses} compressed", output.len());
    } else {
        tracing::info!("copied {} image(s)", output.len());
    }

    Ok(output)
}

pub(crate) fn clear_image_cache(ctx: &TaskContext<'_>) -> anyhow::Result<FileSet> {
    let cache = image_cache(ctx);
    if cache.clear()? {
        tracing::info!(dir = %cache.dir(), "cleared image cache");
    }
    Ok(FileSet::new())
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn gradient_png() -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
        let mut buffer = Vec::new();
        PngEncoder::new_with_quality(&mut buffer, CompressionType::Fast, FilterType::NoFilter)
            .write_image(&img, 64, 64, ExtendedColorType::Rgb8)
            .unwrap();
        buffer
    }

    #[test]
    fn detects_kind_by_extension() {
        assert_eq!(ImageKind::detect(Utf8Path::new("a/b.JPG"), 80), Some(ImageKind::Jpeg(80)));
        assert_eq!(ImageKind::detect(Utf8Path::new("a/b.png"), 80), Some(ImageKind::Png));
        assert_eq!(ImageKind::detect(Utf8Path::new("a/b.svg"), 80), None);
        assert_eq!(ImageKind::detect(Utf8Path::new("a/b.jpeg"), 0), Some(ImageKind::Jpeg(1)));
    }

    #[test]
    fn second_compression_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(Utf8Path::from_path(dir.path()).unwrap().join("images"));
        let png = gradient_png();

        let first = cache.compress(&png, ImageKind::Png).unwrap();
        assert!(!first.hit);
        assert!(first.bytes.len() <= png.len());

        let second = cache.compress(&png, ImageKind::Png).unwrap();
        assert!(second.hit);
        assert_eq!(first.bytes, second.bytes);

        let jpeg = cache.compress(&png, ImageKind::Jpeg(50)).unwrap();
        assert!(!jpeg.hit);

        assert!(cache.clear().unwrap());
        assert!(!cache.compress(&png, ImageKind::Png).unwrap().hit);
    }

    #[test]
    fn broken_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(Utf8Path::from_path(dir.path()).unwrap());

        let err = cache.compress(b"not an image", ImageKind::Png).unwrap_err();
        assert!(matches!(err, ImageError::Image(_)));
    }
}
