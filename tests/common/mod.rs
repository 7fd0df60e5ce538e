//! Shared test fixtures: an in-memory image source, a recording metadata
//! sink with injectable failures, and image byte helpers.
#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use ferroflow::pipeline::{ImageSource, MetadataRecord, MetadataSink};

/// Image source over a fixed map of file names to bytes. A configurable
/// delay simulates slow fetches for timeout tests.
pub struct MemoryImageSource {
    files: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
    fetch_count: AtomicUsize,
}

impl MemoryImageSource {
    pub fn new(files: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            files: files.into_iter().collect(),
            delay: None,
            fetch_count: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for MemoryImageSource {
    async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, String> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.files
            .get(file_name)
            .cloned()
            .ok_or_else(|| format!("not found: {file_name}"))
    }
}

/// Sink that records persisted rows and can fail its first N writes.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<MetadataRecord>>,
    writes: AtomicUsize,
    fail_first: usize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<MetadataRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSink for RecordingSink {
    async fn persist(&self, record: &MetadataRecord) -> Result<(), String> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err("sink write error: injected".to_string());
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Encode a solid-color JPEG of the given dimensions.
pub fn make_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([120, 80, 40]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .expect("encode jpeg");
    out.into_inner()
}

pub fn make_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([0, 0, 0]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}
