//! Image file decoding and encoding.

use image::{DynamicImage, ImageReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("cannot encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Turns files into pixel buffers and back.
///
/// Decode failures are recoverable: reconciliation logs them and moves on.
pub trait ImageCodec {
    fn decode(&self, path: &Path) -> Result<DynamicImage, CodecError>;
    fn encode(&self, image: &DynamicImage, path: &Path) -> Result<(), CodecError>;
}

impl<T: ImageCodec + ?Sized> ImageCodec for Box<T> {
    fn decode(&self, path: &Path) -> Result<DynamicImage, CodecError> {
        (**self).decode(path)
    }

    fn encode(&self, image: &DynamicImage, path: &Path) -> Result<(), CodecError> {
        (**self).encode(image, path)
    }
}

/// Filesystem codec backed by the `image` crate.
///
/// The container format is sniffed from file contents on decode and chosen
/// from the extension on encode. Output is always written as 8-bit RGB.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCodec;

impl ImageCodec for FsCodec {
    fn decode(&self, path: &Path) -> Result<DynamicImage, CodecError> {
        let open_err = |source| CodecError::Open {
            path: path.to_path_buf(),
            source,
        };
        let reader = ImageReader::open(path)
            .map_err(open_err)?
            .with_guessed_format()
            .map_err(open_err)?;
        reader.decode().map_err(|source| CodecError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    fn encode(&self, image: &DynamicImage, path: &Path) -> Result<(), CodecError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| CodecError::Open {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        DynamicImage::ImageRgb8(image.to_rgb8())
            .save(path)
            .map_err(|source| CodecError::Encode {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_encode_then_decode_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/face.png");
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])));

        FsCodec.encode(&img, &path).unwrap();
        let back = FsCodec.decode(&path).unwrap().to_rgb8();

        assert_eq!(back.dimensions(), (4, 3));
        assert_eq!(back.get_pixel(2, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let err = FsCodec.decode(&path).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }), "got {err:?}");
    }

    #[test]
    fn test_decode_missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsCodec.decode(&dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, CodecError::Open { .. }));
    }
}
