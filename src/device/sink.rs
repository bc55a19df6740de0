//! Virtual output device
//!
//! Synthesizes a uinput device whose key surface is cloned from a source
//! device, so every key code the source can produce is valid to emit.
//!
//! Requirements:
//! - /dev/uinput must be accessible (sudo modprobe uinput)

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use super::event::{RawEvent, EV_KEY};
use super::source::SourceDevice;
use super::traits::{DeviceError, DeviceResult, EventSink};

const UINPUT_MAX_NAME_SIZE: usize = 80;
const ABS_CNT: usize = 64;
// uinput_user_dev: name[80] + input_id + ff_effects_max + 4 abs arrays
const USER_DEV_SIZE: usize = UINPUT_MAX_NAME_SIZE + 8 + 4 + 4 * ABS_CNT * 4;

const BUS_VIRTUAL: u16 = 0x06;

// UI_SET_EVBIT = _IOW('U', 100, int)
nix::ioctl_write_int!(ui_set_evbit, b'U', 100);
// UI_SET_KEYBIT = _IOW('U', 101, int)
nix::ioctl_write_int!(ui_set_keybit, b'U', 101);
// UI_DEV_CREATE = _IO('U', 1)
nix::ioctl_none!(ui_dev_create, b'U', 1);
// UI_DEV_DESTROY = _IO('U', 2)
nix::ioctl_none!(ui_dev_destroy, b'U', 2);

/// One registered uinput device
pub struct VirtualDevice {
    file: File,
    created: bool,
}

impl VirtualDevice {
    /// Create a virtual device advertising the key capabilities of `source`.
    /// The source must already be open and bound; this must happen before
    /// the source is grabbed so the capability clone never races a locked
    /// device.
    pub fn create_from(
        source: &SourceDevice,
        uinput_path: &Path,
        name: &str,
    ) -> DeviceResult<Self> {
        if !uinput_path.exists() {
            return Err(DeviceError::Create(format!(
                "{} not found. Load the module: sudo modprobe uinput",
                uinput_path.display()
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(uinput_path)
            .map_err(|e| {
                DeviceError::Create(format!(
                    "cannot open {}: {}. Try: sudo chmod 666 {}",
                    uinput_path.display(),
                    e,
                    uinput_path.display()
                ))
            })?;

        let fd = file.as_raw_fd();
        let caps = source.capabilities();
        tracing::debug!(
            "Source advertises event types {:?}",
            caps.event_types().collect::<Vec<_>>()
        );

        // Clone the key surface. EV_SYN is implicit; anything the source
        // can report as a key must be emittable here.
        unsafe { ui_set_evbit(fd, EV_KEY as libc::c_ulong) }
            .map_err(|e| DeviceError::Create(format!("UI_SET_EVBIT failed: {}", e)))?;
        let mut key_count = 0usize;
        for code in caps.keys() {
            unsafe { ui_set_keybit(fd, code as libc::c_ulong) }
                .map_err(|e| DeviceError::Create(format!("UI_SET_KEYBIT({}) failed: {}", code, e)))?;
            key_count += 1;
        }
        if key_count == 0 {
            return Err(DeviceError::Create(format!(
                "source device \"{}\" advertises no keys",
                source.name()
            )));
        }

        // Old-style uinput setup: write a uinput_user_dev record, then
        // UI_DEV_CREATE.
        let mut setup = vec![0u8; USER_DEV_SIZE];
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(UINPUT_MAX_NAME_SIZE - 1);
        setup[..name_len].copy_from_slice(&name_bytes[..name_len]);
        setup[80..82].copy_from_slice(&BUS_VIRTUAL.to_ne_bytes());
        setup[82..84].copy_from_slice(&0x1209u16.to_ne_bytes()); // vendor
        setup[84..86].copy_from_slice(&0x0001u16.to_ne_bytes()); // product
        setup[86..88].copy_from_slice(&1u16.to_ne_bytes()); // version

        file.write_all(&setup)
            .map_err(|e| DeviceError::Create(format!("uinput setup write failed: {}", e)))?;

        unsafe { ui_dev_create(fd) }
            .map_err(|e| DeviceError::Create(format!("UI_DEV_CREATE failed: {}", e)))?;

        // Give the kernel a moment to register the new node.
        std::thread::sleep(Duration::from_millis(100));

        tracing::info!("Created virtual device \"{}\" ({} keys, fd {})", name, key_count, fd);

        Ok(Self {
            file,
            created: true,
        })
    }
}

impl EventSink for VirtualDevice {
    fn write_event(&mut self, type_: u16, code: u16, value: i32) -> DeviceResult<()> {
        let event = RawEvent::new(type_, code, value);
        self.file.write_all(&event.to_bytes())?;
        Ok(())
    }

    fn destroy(&mut self) -> DeviceResult<()> {
        if !self.created {
            return Ok(());
        }
        unsafe { ui_dev_destroy(self.file.as_raw_fd()) }
            .map_err(|e| DeviceError::Create(format!("UI_DEV_DESTROY failed: {}", e)))?;
        self.created = false;
        tracing::info!("Destroyed virtual device");
        Ok(())
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        if self.created {
            if let Err(e) = self.destroy() {
                tracing::warn!("Failed to destroy virtual device on drop: {}", e);
            }
        }
    }
}
