//! Shared fixtures: a deterministic fake dual encoder, a scripted
//! generator, and builders for image and PDF test documents.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use mmrag::config::Config;
use mmrag::engine::Engine;
use mmrag::session::SessionStore;
use mmrag::sqlite_store::SqliteIndex;
use mmrag_core::embedding::{normalize, Embedder};
use mmrag_core::error::{EmbeddingError, GenerationError};
use mmrag_core::generation::{GenerationRequest, Generator};
use mmrag_core::models::SpaceVersion;
use mmrag_core::store::memory::InMemoryIndex;
use mmrag_core::store::VectorIndex;
use sqlx::SqlitePool;

pub const DIMS: usize = 64;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "is", "are", "what", "which", "in", "on", "to", "and", "about", "does",
    "show", "me", "from", "with",
];

/// Bag-of-words text encoder. Images are mapped to the text of a caption
/// registered for their exact bytes, which puts both modalities in one
/// space the way a real dual encoder would.
pub struct FakeEmbedder {
    model: &'static str,
    captions: Mutex<HashMap<Vec<u8>, String>>,
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Arc<Self> {
        Self::with_model("fake-bow")
    }

    /// Same vectors, reported under another model name, as after swapping
    /// the encoder for a new release.
    pub fn with_model(model: &'static str) -> Arc<Self> {
        Arc::new(Self {
            model,
            captions: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn register_image(&self, bytes: &[u8], caption: &str) {
        self.captions
            .lock()
            .unwrap()
            .insert(bytes.to_vec(), caption.to_string());
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn bag_of_words(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .filter(|w| !STOPWORDS.contains(&w.as_str()))
        {
            let mut h = DefaultHasher::new();
            word.hash(&mut h);
            v[(h.finish() % DIMS as u64) as usize] += 1.0;
        }
        normalize(&v)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn space(&self) -> SpaceVersion {
        SpaceVersion::new(self.model, DIMS)
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("encoder offline".into()));
        }
        Ok(Self::bag_of_words(text))
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("encoder offline".into()));
        }
        let caption = self.captions.lock().unwrap().get(bytes).cloned();
        match caption {
            Some(caption) => Ok(Self::bag_of_words(&caption)),
            None => Err(EmbeddingError::InvalidContent("unknown image".into())),
        }
    }
}

/// Generator that replays queued replies, then falls back to a default
/// reply. Every request is recorded.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    default_reply: Mutex<Result<String, GenerationError>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(Ok(reply.to_string())),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(Err(GenerationError::Unavailable("model offline".into()))),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self, reply: Result<String, GenerationError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> GenerationRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("generator was never called")
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        self.default_reply.lock().unwrap().clone()
    }
}

/// Config with small fast retry budgets.
pub fn test_config(db_path: impl Into<std::path::PathBuf>) -> Config {
    let mut config = Config::minimal(db_path);
    config.embedding.dims = DIMS;
    config.embedding.max_retries = 2;
    config.embedding.backoff_base_ms = 1;
    config.generation.max_retries = 2;
    config.generation.backoff_base_ms = 1;
    config
}

pub struct Harness {
    pub engine: Engine,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<FakeEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    /// Set for SQLite-backed harnesses.
    pub pool: Option<SqlitePool>,
    _tmp: Option<TempDir>,
}

pub fn memory_harness(config: &Config, generator: Arc<ScriptedGenerator>) -> Harness {
    let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
    let embedder = FakeEmbedder::new();
    let engine = Engine::new(
        config,
        index.clone(),
        embedder.clone(),
        generator.clone(),
        SessionStore::in_memory(),
    );
    Harness {
        engine,
        index,
        embedder,
        generator,
        pool: None,
        _tmp: None,
    }
}

pub async fn sqlite_harness(generator: Arc<ScriptedGenerator>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().join("data/mmrag.sqlite"));
    let pool = mmrag::db::connect(&config).await.unwrap();
    mmrag::migrate::apply(&pool).await.unwrap();

    let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool.clone()));
    let embedder = FakeEmbedder::new();
    let engine = Engine::new(
        &config,
        index.clone(),
        embedder.clone(),
        generator.clone(),
        SessionStore::persistent(pool.clone()),
    );
    Harness {
        engine,
        index,
        embedder,
        generator,
        pool: Some(pool),
        _tmp: Some(tmp),
    }
}

/// A small solid-color PNG. Different colors give different bytes.
pub fn png(rgb: [u8; 3]) -> Vec<u8> {
    encode(rgb, image::ImageFormat::Png)
}

pub fn jpeg(rgb: [u8; 3]) -> Vec<u8> {
    encode(rgb, image::ImageFormat::Jpeg)
}

fn encode(rgb: [u8; 3], format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, format)
        .unwrap();
    out.into_inner()
}

/// One page of a test PDF: its text and the raw `DCTDecode` payloads of
/// its images.
pub struct PdfPage<'a> {
    pub text: &'a str,
    pub jpegs: Vec<Vec<u8>>,
}

/// Build a PDF whose pages carry the given text and JPEG image streams.
pub fn build_pdf(pages: &[PdfPage<'_>]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });

    let mut kids: Vec<Object> = Vec::new();
    for page in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(page.text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));

        let mut xobjects = Dictionary::new();
        for (i, jpeg) in page.jpegs.iter().enumerate() {
            let image_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => 8,
                    "Height" => 8,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                    "Filter" => "DCTDecode",
                },
                jpeg.clone(),
            ));
            xobjects.set(format!("Im{}", i + 1), image_id);
        }

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
                "XObject" => xobjects,
            },
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}
