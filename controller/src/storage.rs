//! Keyframe memory in non-volatile storage.
//!
//! Layout: `MAX_KEYFRAMES` packed keyframe records followed by one
//! configuration record.

use std::fs;
use std::path::PathBuf;

use igus_motion::protocol::{ConfigPayload, KeyframeRecord, WirePayload, MAX_KEYFRAMES};
use tracing::{error, info, warn};

pub const EEPROM_SIZE: usize = 4096;

const KEYFRAMES_OFFSET: usize = 0;
const CONFIG_OFFSET: usize = KEYFRAMES_OFFSET + MAX_KEYFRAMES * KeyframeRecord::SIZE;

/// Byte addressed EEPROM.
pub trait Eeprom {
    fn read(&self, address: usize, dest: &mut [u8]);

    /// Writes `data`, skipping cells that already hold the value.
    fn update(&mut self, address: usize, data: &[u8]);
}

impl<E: Eeprom + ?Sized> Eeprom for &mut E {
    fn read(&self, address: usize, dest: &mut [u8]) {
        (**self).read(address, dest)
    }

    fn update(&mut self, address: usize, data: &[u8]) {
        (**self).update(address, data)
    }
}

/// EEPROM image in RAM, erased to `0xFF`.
#[derive(Debug, Clone)]
pub struct MemoryEeprom {
    cells: Vec<u8>,
    writes: usize,
}

impl Default for MemoryEeprom {
    fn default() -> Self {
        Self { cells: vec![0xFF; EEPROM_SIZE], writes: 0 }
    }
}

impl MemoryEeprom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cells actually rewritten so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn image(&self) -> &[u8] {
        &self.cells
    }

    pub fn from_image(image: &[u8]) -> Self {
        let mut cells = vec![0xFF; EEPROM_SIZE];
        let n = image.len().min(EEPROM_SIZE);
        cells[..n].copy_from_slice(&image[..n]);
        Self { cells, writes: 0 }
    }
}

impl Eeprom for MemoryEeprom {
    fn read(&self, address: usize, dest: &mut [u8]) {
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = self.cells.get(address + i).copied().unwrap_or(0xFF);
        }
    }

    fn update(&mut self, address: usize, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            if let Some(cell) = self.cells.get_mut(address + i) {
                if *cell != *byte {
                    *cell = *byte;
                    self.writes += 1;
                }
            }
        }
    }
}

/// EEPROM image backed by a file, rewritten whenever a cell changes.
pub struct FileEeprom {
    path: PathBuf,
    memory: MemoryEeprom,
}

impl FileEeprom {
    /// Opens the image at `path`. A missing file is an erased EEPROM.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let memory = match fs::read(&path) {
            Ok(image) => MemoryEeprom::from_image(&image),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryEeprom::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, memory })
    }
}

impl Eeprom for FileEeprom {
    fn read(&self, address: usize, dest: &mut [u8]) {
        self.memory.read(address, dest)
    }

    fn update(&mut self, address: usize, data: &[u8]) {
        let before = self.memory.writes();
        self.memory.update(address, data);
        if self.memory.writes() != before {
            if let Err(e) = fs::write(&self.path, self.memory.image()) {
                error!("Could not write EEPROM image {}: {}", self.path.display(), e);
            }
        }
    }
}

pub struct Storage<E: Eeprom> {
    eeprom: E,
}

impl<E: Eeprom> Storage<E> {
    pub fn new(eeprom: E) -> Self {
        Self { eeprom }
    }

    pub fn eeprom(&self) -> &E {
        &self.eeprom
    }

    /// Loads the stored configuration, or a safe default when the storage
    /// is erased or holds garbage.
    pub fn load_config(&self) -> ConfigPayload {
        let mut raw = [0u8; ConfigPayload::SIZE];
        self.eeprom.read(CONFIG_OFFSET, &mut raw);
        let config = ConfigPayload::from_bytes(&raw).unwrap_or_default();
        if config.active_axes == 0xFFFF || config.num_keyframes as usize >= MAX_KEYFRAMES {
            warn!("No valid configuration found in EEPROM");
            return ConfigPayload { active_axes: 4, num_keyframes: 0, ..config };
        }
        info!("Loaded configuration: {} keyframes on {} axes", config.num_keyframes, config.active_axes);
        config
    }

    pub fn save_config(&mut self, config: &ConfigPayload) {
        if let Ok(bytes) = config.to_bytes() {
            self.eeprom.update(CONFIG_OFFSET, &bytes);
        }
    }

    pub fn read_keyframe(&self, index: usize) -> KeyframeRecord {
        if index >= MAX_KEYFRAMES {
            return KeyframeRecord::default();
        }
        let mut raw = [0u8; KeyframeRecord::SIZE];
        self.eeprom.read(KEYFRAMES_OFFSET + index * KeyframeRecord::SIZE, &mut raw);
        KeyframeRecord::from_bytes(&raw).unwrap_or_default()
    }

    pub fn save_keyframe(&mut self, index: usize, keyframe: &KeyframeRecord) {
        if index >= MAX_KEYFRAMES {
            return;
        }
        if let Ok(bytes) = keyframe.to_bytes() {
            self.eeprom.update(KEYFRAMES_OFFSET + index * KeyframeRecord::SIZE, &bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_storage_gives_default_config() {
        let storage = Storage::new(MemoryEeprom::new());
        let config = storage.load_config();
        assert_eq!(config.active_axes, 4);
        assert_eq!(config.num_keyframes, 0);
    }

    #[test]
    fn keyframes_and_config_survive_a_reboot() {
        let mut storage = Storage::new(MemoryEeprom::new());
        let keyframe = KeyframeRecord { duration: 500, ticks: [16384, 17000, 0, 0, 0, 0, 0, 0], output_command: 1 };
        storage.save_keyframe(3, &keyframe);
        storage.save_config(&ConfigPayload { num_keyframes: 4, active_axes: 2, lookahead: 150, ..Default::default() });

        let rebooted = Storage::new(MemoryEeprom::from_image(storage.eeprom().image()));
        assert_eq!(rebooted.read_keyframe(3), keyframe);
        let config = rebooted.load_config();
        assert_eq!(config.num_keyframes, 4);
        assert_eq!(config.lookahead, 150);
    }

    #[test]
    fn update_skips_unchanged_cells() {
        let mut eeprom = MemoryEeprom::new();
        eeprom.update(10, &[1, 2, 3]);
        eeprom.update(10, &[1, 2, 4]);
        assert_eq!(eeprom.writes(), 4);
    }

    #[test]
    fn too_many_keyframes_is_invalid() {
        let mut storage = Storage::new(MemoryEeprom::new());
        storage.save_config(&ConfigPayload { num_keyframes: MAX_KEYFRAMES as u16, active_axes: 2, ..Default::default() });
        assert_eq!(storage.load_config().num_keyframes, 0);
    }
}
