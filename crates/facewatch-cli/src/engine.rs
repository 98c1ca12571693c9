use facewatch_core::{
    BoundingBox, EmbeddingExtractor, EnrollReport, ImageCodec, ReconcileError, Recognition,
    Reconciler,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A face found in an image and what it was recognised as.
#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    pub bbox: BoundingBox,
    #[serde(flatten)]
    pub recognition: Recognition,
}

/// Messages sent from the command handlers to the engine thread.
enum EngineRequest {
    Enroll {
        reply: oneshot::Sender<Result<EnrollReport, EngineError>>,
    },
    Identify {
        path: PathBuf,
        threshold: f32,
        reply: oneshot::Sender<Result<Option<Identification>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run one reconciliation pass over the source tree.
    pub async fn enroll(&self) -> Result<EnrollReport, EngineError> {
        self.request(|reply| EngineRequest::Enroll { reply }).await
    }

    /// Decode the image at `path`, extract its face and recognise it.
    /// `None` when the image holds no detectable face.
    pub async fn identify(
        &self,
        path: PathBuf,
        threshold: f32,
    ) -> Result<Option<Identification>, EngineError> {
        self.request(|reply| EngineRequest::Identify {
            path,
            threshold,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Move an opened reconciler onto a dedicated OS thread and serve requests
/// until every handle is dropped.
///
/// All stores are only touched from that thread, so index, metadata and
/// cache writes never interleave.
pub fn spawn_engine<E, C>(mut reconciler: Reconciler<E, C>) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + Send + 'static,
    C: ImageCodec + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { reply } => {
                        let _ = reply.send(reconciler.enroll_once().map_err(Into::into));
                    }
                    EngineRequest::Identify {
                        path,
                        threshold,
                        reply,
                    } => {
                        let result = reconciler
                            .identify_file(&path, threshold)
                            .map(|found| {
                                found.map(|(face, recognition)| Identification {
                                    bbox: face.bbox,
                                    recognition,
                                })
                            })
                            .map_err(Into::into);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::extractor::ExtractorError;
    use facewatch_core::{DataLayout, Embedding, Face, FsCodec, EMBEDDING_DIM};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::path::Path;

    /// Top-left pixel colour as the embedding direction; black is "no face".
    struct PixelExtractor;

    impl EmbeddingExtractor for PixelExtractor {
        fn extract(&mut self, image: &DynamicImage) -> Result<Option<Face>, ExtractorError> {
            let rgb = image.to_rgb8();
            let Rgb(color) = *rgb.get_pixel(0, 0);
            if color == [0, 0, 0] {
                return Ok(None);
            }
            let mut values = vec![0.0f32; EMBEDDING_DIM];
            for (slot, channel) in values.iter_mut().zip(color) {
                *slot = f32::from(channel);
            }
            Ok(Some(Face {
                embedding: Embedding::new(values),
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: rgb.width() as f32,
                    height: rgb.height() as f32,
                    confidence: 1.0,
                    landmarks: None,
                },
            }))
        }
    }

    fn write_image(path: &Path, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(8, 8, Rgb(color))
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    fn start(root: &Path) -> EngineHandle {
        let reconciler = Reconciler::open(
            root.join("enroll_folder"),
            DataLayout::new(root.join("data")),
            PixelExtractor,
            FsCodec,
        )
        .unwrap();
        spawn_engine(reconciler).unwrap()
    }

    #[tokio::test]
    async fn test_enroll_then_identify() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("enroll_folder/alice/1.jpg"), [200, 0, 0]);
        write_image(&dir.path().join("enroll_folder/bob/1.jpg"), [0, 0, 200]);
        let engine = start(dir.path());

        let report = engine.enroll().await.unwrap();
        assert_eq!(report.embeddings_added, 2);
        assert_eq!(report.new_identifiers, vec!["alice", "bob"]);

        let sample = dir.path().join("sample.png");
        write_image(&sample, [190, 5, 0]);
        let found = engine.identify(sample, 0.6).await.unwrap().unwrap();
        assert_eq!(found.recognition.identifier(), Some("alice"));

        let dark = dir.path().join("dark.png");
        write_image(&dark, [0, 0, 0]);
        assert!(engine.identify(dark, 0.6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identify_before_enrollment() {
        let dir = tempfile::tempdir().unwrap();
        let engine = start(dir.path());

        let sample = dir.path().join("sample.png");
        write_image(&sample, [10, 200, 10]);
        let found = engine.identify(sample, 0.6).await.unwrap().unwrap();
        assert_eq!(found.recognition, Recognition::NoEnrolledFaces);

        let missing = engine.identify(dir.path().join("nope.png"), 0.6).await;
        assert!(matches!(missing, Err(EngineError::Reconcile(ReconcileError::Codec(_)))));
    }

    #[test]
    fn test_identification_serializes_flat() {
        let found = Identification {
            bbox: BoundingBox {
                x: 1.0,
                y: 2.0,
                width: 3.0,
                height: 4.0,
                confidence: 0.9,
                landmarks: None,
            },
            recognition: Recognition::Unknown {
                nearest: "bob".into(),
                distance: 0.8,
            },
        };
        let json = serde_json::to_value(&found).unwrap();
        assert_eq!(json["result"], "unknown");
        assert_eq!(json["nearest"], "bob");
        assert_eq!(json["bbox"]["width"], 3.0);
    }
}
