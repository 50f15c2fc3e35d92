//! Chime store: the on-disk WAV library pre-encoded to Opus at startup.
//!
//! Every chime is encoded exactly once into the same frame sequence a live
//! speaker would produce, so playout is a straight paced fan-out of stored
//! packets. The `doorbell` chime is embedded in the binary and re-seeded
//! into the data directory whenever the file is missing; it can be
//! replaced by upload but never deleted.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::codec::AudioEncoder;
use crate::error::{IntercomError, IntercomResult};
use crate::protocol::{
    CHANNELS, FRAME_DURATION_MS, FRAME_SAMPLES, MAX_CHIME_UPLOAD_BYTES, RESERVED_CHIME,
    SAMPLE_RATE,
};
use crate::utils::valid_chime_name;

/// Bundled default chime, re-seeded into the data directory when missing.
static DEFAULT_DOORBELL_WAV: &[u8] = include_bytes!("../assets/doorbell.wav");

/// File holding the active chime name, relative to the data directory.
const ACTIVE_CHIME_FILE: &str = "active_chime";

/// A pre-encoded chime.
#[derive(Debug)]
pub struct Chime {
    pub name: String,
    /// Opus payloads, one per 20 ms frame.
    pub frames: Vec<Bytes>,
    pub duration_ms: u64,
}

/// Listing entry for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ChimeInfo {
    pub name: String,
    pub duration_ms: u64,
    pub frames: usize,
    pub active: bool,
}

/// Process-wide chime library.
pub struct ChimeStore {
    chime_dir: PathBuf,
    active_file: PathBuf,
    chimes: RwLock<HashMap<String, Arc<Chime>>>,
    active: Mutex<String>,
}

impl ChimeStore {
    /// Opens the store: seeds the default set, pre-encodes every WAV in
    /// the chime directory, and restores the persisted active selection.
    ///
    /// A user WAV that fails validation is skipped with a warning; the
    /// embedded doorbell always loads, so the store is never empty.
    pub fn open(data_dir: &Path) -> IntercomResult<Self> {
        let chime_dir = data_dir.join("chimes");
        std::fs::create_dir_all(&chime_dir)
            .map_err(|e| IntercomError::Internal(format!("create {:?}: {}", chime_dir, e)))?;

        let doorbell_path = chime_dir.join(format!("{}.wav", RESERVED_CHIME));
        if !doorbell_path.exists() {
            log::info!("[Chime] Seeding default '{}'", RESERVED_CHIME);
            std::fs::write(&doorbell_path, DEFAULT_DOORBELL_WAV)
                .map_err(|e| IntercomError::Internal(format!("seed doorbell: {}", e)))?;
        }

        let mut chimes = HashMap::new();
        let entries = std::fs::read_dir(&chime_dir)
            .map_err(|e| IntercomError::Internal(format!("read {:?}: {}", chime_dir, e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = stem.to_ascii_lowercase();
            if !valid_chime_name(&name) {
                log::warn!("[Chime] Skipping '{}': invalid name", stem);
                continue;
            }
            match std::fs::read(&path) {
                Ok(bytes) => match encode_wav(&name, &bytes) {
                    Ok(chime) => {
                        log::info!(
                            "[Chime] Loaded '{}' ({} frames, {} ms)",
                            name,
                            chime.frames.len(),
                            chime.duration_ms
                        );
                        chimes.insert(name, Arc::new(chime));
                    }
                    Err(e) => log::warn!("[Chime] Skipping '{}': {}", name, e),
                },
                Err(e) => log::warn!("[Chime] Skipping '{}': {}", name, e),
            }
        }

        // The embedded default must always decode; anything else is a build defect.
        if !chimes.contains_key(RESERVED_CHIME) {
            let chime = encode_wav(RESERVED_CHIME, DEFAULT_DOORBELL_WAV)?;
            chimes.insert(RESERVED_CHIME.to_string(), Arc::new(chime));
        }

        let active_file = data_dir.join(ACTIVE_CHIME_FILE);
        let active = std::fs::read_to_string(&active_file)
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|name| chimes.contains_key(name))
            .unwrap_or_else(|| RESERVED_CHIME.to_string());

        Ok(Self {
            chime_dir,
            active_file,
            chimes: RwLock::new(chimes),
            active: Mutex::new(active),
        })
    }

    /// Lists all chimes, sorted by name.
    pub fn list(&self) -> Vec<ChimeInfo> {
        let active = self.active.lock().clone();
        let mut out: Vec<ChimeInfo> = self
            .chimes
            .read()
            .values()
            .map(|c| ChimeInfo {
                name: c.name.clone(),
                duration_ms: c.duration_ms,
                frames: c.frames.len(),
                active: c.name == active,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Fetches a chime's pre-encoded frames.
    pub fn get(&self, name: &str) -> Option<Arc<Chime>> {
        self.chimes.read().get(name).cloned()
    }

    /// Validates and installs an uploaded WAV, replacing any existing
    /// chime of the same name.
    pub fn upload(&self, file_name: &str, bytes: &[u8]) -> IntercomResult<ChimeInfo> {
        if bytes.len() > MAX_CHIME_UPLOAD_BYTES {
            return Err(IntercomError::TooLarge(bytes.len()));
        }
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !valid_chime_name(&stem) {
            return Err(IntercomError::InvalidRequest(format!(
                "chime name '{}' must match [a-z0-9_-]+",
                stem
            )));
        }

        // Validate and re-encode before anything touches the disk.
        let chime = encode_wav(&stem, bytes)?;

        let path = self.chime_dir.join(format!("{}.wav", stem));
        std::fs::write(&path, bytes)
            .map_err(|e| IntercomError::Internal(format!("write {:?}: {}", path, e)))?;

        let info = ChimeInfo {
            name: stem.clone(),
            duration_ms: chime.duration_ms,
            frames: chime.frames.len(),
            active: *self.active.lock() == stem,
        };
        log::info!(
            "[Chime] Installed '{}' ({} frames, {} ms)",
            stem,
            info.frames,
            info.duration_ms
        );
        self.chimes.write().insert(stem, Arc::new(chime));
        Ok(info)
    }

    /// Deletes a chime. `doorbell` is undeletable; deleting the active
    /// chime falls the selection back to `doorbell`.
    pub fn delete(&self, name: &str) -> IntercomResult<()> {
        if name == RESERVED_CHIME {
            return Err(IntercomError::ReservedName(name.to_string()));
        }
        if self.chimes.write().remove(name).is_none() {
            return Err(IntercomError::NotFound(name.to_string()));
        }
        let path = self.chime_dir.join(format!("{}.wav", name));
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("[Chime] Could not remove {:?}: {}", path, e);
        }
        let mut active = self.active.lock();
        if *active == name {
            *active = RESERVED_CHIME.to_string();
            self.persist_active(&active);
        }
        Ok(())
    }

    /// Selects the process-wide active chime and persists the choice.
    pub fn set_active(&self, name: &str) -> IntercomResult<()> {
        if !self.chimes.read().contains_key(name) {
            return Err(IntercomError::NotFound(name.to_string()));
        }
        let mut active = self.active.lock();
        *active = name.to_string();
        self.persist_active(&active);
        Ok(())
    }

    /// Name of the active chime.
    pub fn active_name(&self) -> String {
        self.active.lock().clone()
    }

    /// The active chime's frames.
    pub fn active_chime(&self) -> Arc<Chime> {
        let name = self.active.lock().clone();
        self.get(&name)
            .or_else(|| self.get(RESERVED_CHIME))
            .expect("doorbell chime always present")
    }

    fn persist_active(&self, name: &str) {
        if let Err(e) = std::fs::write(&self.active_file, name) {
            log::warn!("[Chime] Could not persist active chime: {}", e);
        }
    }
}

/// Validates a WAV as 16 kHz mono 16-bit PCM and pre-encodes it into the
/// frame sequence a live speaker would produce (last frame zero-padded).
fn encode_wav(name: &str, bytes: &[u8]) -> IntercomResult<Chime> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| IntercomError::BadWav(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(IntercomError::BadWav(format!(
            "need 16-bit PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    if spec.channels != CHANNELS || spec.sample_rate != SAMPLE_RATE {
        return Err(IntercomError::BadWav(format!(
            "need {} Hz mono, got {} Hz {}ch",
            SAMPLE_RATE, spec.sample_rate, spec.channels
        )));
    }

    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<Result<_, _>>()
        .map_err(|e| IntercomError::BadWav(e.to_string()))?;
    if samples.is_empty() {
        return Err(IntercomError::BadWav("no audio data".to_string()));
    }

    let mut encoder = AudioEncoder::new()?;
    let mut frames = Vec::with_capacity(samples.len().div_ceil(FRAME_SAMPLES));
    for chunk in samples.chunks(FRAME_SAMPLES) {
        let payload = if chunk.len() == FRAME_SAMPLES {
            encoder.encode(chunk)?
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(FRAME_SAMPLES, 0);
            encoder.encode(&padded)?
        };
        frames.push(Bytes::from(payload));
    }

    let duration_ms = frames.len() as u64 * FRAME_DURATION_MS as u64;
    Ok(Chime {
        name: name.to_string(),
        frames,
        duration_ms,
    })
}
