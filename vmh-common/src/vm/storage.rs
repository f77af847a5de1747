//! Storage pool: named disk volumes the VM can boot from or plug in.

use super::HypervisorBackend;
use crate::errors::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    #[default]
    Qcow2,
    Raw,
}

impl FromStr for VolumeFormat {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qcow2" => Ok(Self::Qcow2),
            "raw" => Ok(Self::Raw),
            other => Err(HarnessError::usage(format!("unknown volume format '{other}'"))),
        }
    }
}

/// Size units as written in scenarios. Decimal units are powers of 1000,
/// binary units (and the short `k`/`M`/`G`/`T` forms) powers of 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    Bytes,
    KB,
    KiB,
    MB,
    MiB,
    GB,
    GiB,
    TB,
    TiB,
}

impl SizeUnit {
    pub const fn multiplier(&self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::KB => 1_000,
            Self::KiB => 1 << 10,
            Self::MB => 1_000_000,
            Self::MiB => 1 << 20,
            Self::GB => 1_000_000_000,
            Self::GiB => 1 << 30,
            Self::TB => 1_000_000_000_000,
            Self::TiB => 1 << 40,
        }
    }
}

impl FromStr for SizeUnit {
    type Err = HarnessError;

    fn from_str(unit: &str) -> Result<Self, Self::Err> {
        let parsed = match unit {
            "bytes" | "byte" | "b" | "B" => Self::Bytes,
            "KB" => Self::KB,
            "k" | "KiB" => Self::KiB,
            "MB" => Self::MB,
            "M" | "MiB" => Self::MiB,
            "GB" => Self::GB,
            "G" | "GiB" => Self::GiB,
            "TB" => Self::TB,
            "T" | "TiB" => Self::TiB,
            _ => return Err(HarnessError::usage(format!("invalid size unit '{unit}'"))),
        };
        Ok(parsed)
    }
}

impl fmt::Display for SizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes => f.write_str("bytes"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// `size` in `unit`, as bytes. Overflow is a usage error.
pub fn convert_to_bytes(size: u64, unit: SizeUnit) -> HarnessResult<u64> {
    size.checked_mul(unit.multiplier())
        .ok_or_else(|| HarnessError::usage(format!("{size} {unit} does not fit in 64 bits")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub size: u64,
    pub unit: SizeUnit,
    pub format: VolumeFormat,
    /// Deleted when the scenario ends.
    pub temporary: bool,
}

impl Volume {
    pub fn bytes(&self) -> HarnessResult<u64> {
        convert_to_bytes(self.size, self.unit)
    }
}

/// Handle on the hypervisor's volume pool. Cheap to clone, so cleanup
/// hooks can own one.
#[derive(Clone)]
pub struct StoragePool {
    backend: Arc<dyn HypervisorBackend>,
}

impl fmt::Debug for StoragePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoragePool").finish_non_exhaustive()
    }
}

impl StoragePool {
    pub fn new(backend: Arc<dyn HypervisorBackend>) -> Self {
        Self { backend }
    }

    fn create(&self, name: &str, size: u64, unit: SizeUnit, format: VolumeFormat, temporary: bool) -> HarnessResult<Volume> {
        if name.is_empty() {
            return Err(HarnessError::usage("volume name must not be empty"));
        }
        if self.volume_exists(name)? {
            return Err(HarnessError::usage(format!("a volume named '{name}' already exists")));
        }
        let volume = Volume {
            name: name.to_string(),
            size,
            unit,
            format,
            temporary,
        };
        let bytes = volume.bytes()?;
        self.backend.create_volume(&volume)?;
        info!(volume = name, bytes, ?format, temporary, "volume created");
        Ok(volume)
    }

    pub fn create_new_disk(&self, name: &str, size: u64, unit: SizeUnit, format: VolumeFormat) -> HarnessResult<Volume> {
        self.create(name, size, unit, format, false)
    }

    /// Like [`StoragePool::create_new_disk`], but marked temporary. The
    /// caller registers the deleting cleanup hook.
    pub fn create_temporary_disk(&self, name: &str, size: u64, unit: SizeUnit, format: VolumeFormat) -> HarnessResult<Volume> {
        self.create(name, size, unit, format, true)
    }

    pub fn delete_volume(&self, name: &str) -> HarnessResult<()> {
        if !self.volume_exists(name)? {
            return Err(HarnessError::usage(format!("volume '{name}' does not exist")));
        }
        self.backend.delete_volume(name)?;
        info!(volume = name, "volume deleted");
        Ok(())
    }

    /// Delete `name` if present; returns whether anything was deleted.
    pub fn delete_volume_if_exists(&self, name: &str) -> HarnessResult<bool> {
        if self.volume_exists(name)? {
            self.delete_volume(name)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn volume(&self, name: &str) -> HarnessResult<Option<Volume>> {
        Ok(self.backend.list_volumes()?.into_iter().find(|v| v.name == name))
    }

    pub fn volume_exists(&self, name: &str) -> HarnessResult<bool> {
        Ok(self.volume(name)?.is_some())
    }

    pub fn list_volumes(&self) -> HarnessResult<Vec<Volume>> {
        self.backend.list_volumes()
    }
}
