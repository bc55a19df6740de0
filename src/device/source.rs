//! Physical source device
//!
//! Owns the file descriptor of one `/dev/input/event*` character device,
//! its capability bitmaps, and the exclusive-grab state.
//!
//! Requirements:
//! - User must be in the 'input' group or run as root

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use super::event::{RawEvent, EVENT_SIZE};
use super::traits::{DeviceError, DeviceResult, EventSource, ReadStatus};

// EV_MAX is 0x1f, KEY_MAX is 0x2ff; bitmap lengths rounded up to bytes.
const TYPE_BITS_LEN: usize = 4;
const KEY_BITS_LEN: usize = 96;

// EVIOCGRAB = _IOW('E', 0x90, int)
nix::ioctl_write_int!(eviocgrab, b'E', 0x90);
// EVIOCGNAME(len) = _IOC(_IOC_READ, 'E', 0x06, len)
nix::ioctl_read_buf!(eviocgname, b'E', 0x06, u8);
// EVIOCGBIT(0, len) - bitmap of supported event types
nix::ioctl_read_buf!(eviocgbit_types, b'E', 0x20, u8);
// EVIOCGBIT(EV_KEY, len) - bitmap of supported key codes
nix::ioctl_read_buf!(eviocgbit_keys, b'E', 0x21, u8);

/// Capability bitmaps reported by a source device, used to clone its
/// advertised event surface onto the virtual device.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub type_bits: [u8; TYPE_BITS_LEN],
    pub key_bits: [u8; KEY_BITS_LEN],
}

impl Capabilities {
    pub fn event_types(&self) -> impl Iterator<Item = u16> + '_ {
        set_bits(&self.type_bits)
    }

    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        set_bits(&self.key_bits)
    }

    pub fn has_key(&self, code: u16) -> bool {
        let idx = code as usize;
        idx / 8 < KEY_BITS_LEN && self.key_bits[idx / 8] & (1 << (idx % 8)) != 0
    }
}

fn set_bits(bits: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bits.iter().enumerate().flat_map(|(byte_idx, byte)| {
        (0..8).filter_map(move |bit| {
            if byte & (1 << bit) != 0 {
                Some((byte_idx * 8 + bit) as u16)
            } else {
                None
            }
        })
    })
}

/// One grabbed physical input device
#[derive(Debug)]
pub struct SourceDevice {
    file: File,
    path: PathBuf,
    name: String,
    capabilities: Capabilities,
    grabbed: bool,
    buf: [u8; EVENT_SIZE],
}

impl SourceDevice {
    /// Open the device, verify it is a character device, switch the fd to
    /// non-blocking reads, and interrogate its name and capabilities.
    pub fn open(path: &Path) -> DeviceResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| DeviceError::Open {
                path: path.display().to_string(),
                source: e,
            })?;

        let meta = file.metadata().map_err(|e| DeviceError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        if !meta.file_type().is_char_device() {
            return Err(DeviceError::Bind {
                path: path.display().to_string(),
                reason: "not a character device".to_string(),
            });
        }

        let fd = file.as_raw_fd();

        // Non-blocking reads; the loop waits with poll() instead.
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| DeviceError::Bind {
            path: path.display().to_string(),
            reason: format!("F_GETFL failed: {}", e),
        })?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| DeviceError::Bind {
            path: path.display().to_string(),
            reason: format!("F_SETFL failed: {}", e),
        })?;

        let name = read_name(fd);
        let capabilities = read_capabilities(fd).map_err(|reason| DeviceError::Bind {
            path: path.display().to_string(),
            reason,
        })?;

        tracing::info!(
            "Opened source device {} (\"{}\", fd {})",
            path.display(),
            name,
            fd
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            name,
            capabilities,
            grabbed: false,
            buf: [0u8; EVENT_SIZE],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

impl EventSource for SourceDevice {
    fn grab(&mut self) -> DeviceResult<()> {
        // EVIOCGRAB is not idempotent; the state machine calls this exactly
        // once per transition and we track the state ourselves.
        if self.grabbed {
            return Ok(());
        }
        unsafe { eviocgrab(self.file.as_raw_fd(), 1) }
            .map_err(|e| DeviceError::Grab(format!("{}: {}", self.path.display(), e)))?;
        self.grabbed = true;
        tracing::info!("Grabbed {} exclusively", self.path.display());
        Ok(())
    }

    fn release(&mut self) -> DeviceResult<()> {
        if !self.grabbed {
            return Ok(());
        }
        unsafe { eviocgrab(self.file.as_raw_fd(), 0) }
            .map_err(|e| DeviceError::Grab(format!("{}: {}", self.path.display(), e)))?;
        self.grabbed = false;
        tracing::info!("Released grab on {}", self.path.display());
        Ok(())
    }

    fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    fn next_event(&mut self) -> DeviceResult<ReadStatus> {
        match self.file.read(&mut self.buf) {
            Ok(n) if n == EVENT_SIZE => match RawEvent::from_bytes(&self.buf) {
                Some(event) => Ok(ReadStatus::Event(event)),
                None => Err(DeviceError::Read(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "failed to decode event record",
                ))),
            },
            // The kernel hands out whole records; anything else means the
            // device went away under us.
            Ok(n) => Err(DeviceError::Read(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read of {} bytes", n),
            ))),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(ReadStatus::Empty),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(ReadStatus::Empty),
            Err(e) => Err(DeviceError::Read(e)),
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> DeviceResult<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                // Signal delivery; let the loop observe its shutdown flag.
                return Ok(false);
            }
            return Err(DeviceError::Read(err));
        }
        Ok(rc > 0)
    }
}

impl Drop for SourceDevice {
    fn drop(&mut self) {
        // Whatever path got us here, never leave the physical device
        // locked to a dead process.
        if self.grabbed {
            if let Err(e) = self.release() {
                tracing::warn!("Failed to release grab on drop: {}", e);
            }
        }
    }
}

fn read_name(fd: RawFd) -> String {
    let mut buf = [0u8; 256];
    match unsafe { eviocgname(fd, &mut buf) } {
        Ok(_) => {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..end]).to_string()
        }
        Err(_) => String::new(),
    }
}

fn read_capabilities(fd: RawFd) -> Result<Capabilities, String> {
    let mut type_bits = [0u8; TYPE_BITS_LEN];
    unsafe { eviocgbit_types(fd, &mut type_bits) }
        .map_err(|e| format!("EVIOCGBIT(types) failed: {}", e))?;

    let mut key_bits = [0u8; KEY_BITS_LEN];
    unsafe { eviocgbit_keys(fd, &mut key_bits) }
        .map_err(|e| format!("EVIOCGBIT(keys) failed: {}", e))?;

    Ok(Capabilities {
        type_bits,
        key_bits,
    })
}

/// Enumerate input devices on the system with their human-readable names.
pub fn enumerate_devices() -> DeviceResult<Vec<(PathBuf, String)>> {
    let input_dir = Path::new("/dev/input");
    if !input_dir.exists() {
        return Err(DeviceError::Bind {
            path: "/dev/input".to_string(),
            reason: "directory not found".to_string(),
        });
    }

    let mut devices = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !file_name.starts_with("event") {
            continue;
        }
        // Read device name from sysfs; no open permission needed there.
        let sysfs_path = format!("/sys/class/input/{}/device/name", file_name);
        let name = std::fs::read_to_string(&sysfs_path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        devices.push((path, name));
    }

    devices.sort();
    Ok(devices)
}
