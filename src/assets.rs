//! Pattern Store
//!
//! Loads all reference patterns up front with one loader thread per file,
//! so startup is not serialized on disk reads. Missing optional patterns
//! are logged and skipped; the caller decides which names are required.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::matcher::Pattern;

pub struct PatternStore {
    patterns: HashMap<String, Pattern>,
}

impl PatternStore {
    /// Load `names` from `dir` concurrently using `load`, which maps a file
    /// path to a decoded pattern. Files that fail to load are skipped with
    /// a warning.
    pub fn scan<F>(dir: &Path, names: &[String], load: F) -> Self
    where
        F: Fn(&Path, &str) -> anyhow::Result<Pattern> + Sync,
    {
        let mut patterns = HashMap::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let load = &load;
                    let path = pattern_path(dir, name);
                    scope.spawn(move || match load(&path, name) {
                        Ok(pattern) => Some((name.clone(), pattern)),
                        Err(err) => {
                            warn!(name, path = %path.display(), %err, "pattern not loaded");
                            None
                        }
                    })
                })
                .collect();
            for handle in handles {
                if let Some((name, pattern)) = handle.join().unwrap() {
                    patterns.insert(name, pattern);
                }
            }
        });
        info!(loaded = patterns.len(), requested = names.len(), "pattern store ready");
        Self { patterns }
    }

    pub fn from_patterns(patterns: Vec<Pattern>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Pattern> {
        self.patterns.get(name)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True when every required name is present; logs each hole.
    pub fn verify_required(&self, names: &[&str]) -> bool {
        let mut ok = true;
        for name in names {
            if !self.patterns.contains_key(*name) {
                warn!(name, "required pattern missing");
                ok = false;
            }
        }
        ok
    }
}

fn pattern_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.png"))
}

/// Decode a PNG into a pattern. Alpha becomes the mask when the image
/// carries transparency; RGB input is expanded to opaque RGBA.
#[cfg(feature = "vision")]
pub fn load_png_pattern(path: &Path, name: &str) -> anyhow::Result<Pattern> {
    use std::fs::File;

    let decoder = png::Decoder::new(File::open(path)?);
    let mut reader = decoder.read_info()?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let frame_info = reader.next_frame(&mut buf)?;
    buf.truncate(frame_info.buffer_size());

    let (pixels, mask) = match frame_info.color_type {
        png::ColorType::Rgba => {
            let has_transparency = buf.chunks_exact(4).any(|px| px[3] < 255);
            let mask = has_transparency
                .then(|| buf.chunks_exact(4).map(|px| px[3]).collect());
            (buf, mask)
        }
        png::ColorType::Rgb => {
            let mut rgba = Vec::with_capacity(buf.len() / 3 * 4);
            for px in buf.chunks_exact(3) {
                rgba.extend_from_slice(px);
                rgba.push(255);
            }
            (rgba, None)
        }
        other => anyhow::bail!("unsupported PNG color type {other:?} in {}", path.display()),
    };

    Ok(Pattern {
        name: name.to_string(),
        width: frame_info.width,
        height: frame_info.height,
        pixels,
        mask,
    })
}
