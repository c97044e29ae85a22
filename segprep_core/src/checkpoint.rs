//! Versioned binary persistence for run state that outlives a process.
//!
//! A checkpoint file is a four byte tag, the schema version and the payload,
//! all through one fixed-width bincode codec. Implementors only describe how
//! their state maps to a serializable snapshot; the framing and the version
//! check live here.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Leading bytes of every checkpoint file.
pub const CHECKPOINT_TAG: [u8; 4] = *b"SGPC";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error while accessing checkpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize checkpoint payload: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("checkpoint version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("checkpoint file has invalid structure: {0}")]
    InvalidFormat(String),
}

/// Fixed-width little-endian codec; identical state always yields identical bytes.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
}

pub trait Checkpointable: Sized {
    /// Serializable form of the state.
    type Snapshot: Serialize + DeserializeOwned;

    /// Schema version written next to the snapshot. Bump on layout changes.
    const VERSION: u32;

    fn snapshot(&self) -> Self::Snapshot;

    /// Rebuild state from a snapshot whose version already matched.
    fn restore(snapshot: Self::Snapshot) -> Result<Self, CheckpointError>;

    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        write_framed(path.as_ref(), Self::VERSION, &self.snapshot())
    }

    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let (version, snapshot) = read_framed::<Self::Snapshot>(path.as_ref())?;
        if version != Self::VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: Self::VERSION,
                found: version,
            });
        }
        Self::restore(snapshot)
    }
}

/// Write `payload` under `version`, creating parent directories.
pub fn write_framed<T: Serialize>(path: &Path, version: u32, payload: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&CHECKPOINT_TAG)?;
    codec().serialize_into(&mut writer, &version)?;
    codec().serialize_into(&mut writer, payload)?;
    writer.flush()?;
    Ok(())
}

fn read_framed<T: DeserializeOwned>(path: &Path) -> Result<(u32, T), CheckpointError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut tag = [0u8; 4];
    reader.read_exact(&mut tag).map_err(|_| {
        CheckpointError::InvalidFormat(format!("{} is too short", path.display()))
    })?;
    if tag != CHECKPOINT_TAG {
        return Err(CheckpointError::InvalidFormat(format!(
            "{} is not a checkpoint file",
            path.display()
        )));
    }
    let version: u32 = codec().deserialize_from(&mut reader)?;
    if version == 0 {
        return Err(CheckpointError::InvalidFormat("version 0 is never written".into()));
    }
    let payload = codec().deserialize_from(&mut reader)?;
    Ok((version, payload))
}
