//! SystemAudio sender: plays the mixed signal out through a local audio
//! backend rather than over the network. Backend choice is derived once, at
//! construction, from the sink's `output_ip` prefix (`127.` selects the
//! loopback FIFO backend; anything else selects the platform backend when
//! one is compiled in, falling back to FIFO otherwise).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use parking_lot::Mutex;

use crate::mixer::mixing::CsrcSet;

use super::NetworkSender;

/// The narrow seam real platform playback backends implement. A FIFO-file
/// backend (always available) satisfies it without any platform
/// dependency; `cfg`-gated ALSA/WASAPI backends plug in behind the same
/// trait, mirroring how the capture side of this ecosystem isolates
/// platform code behind `cfg(windows)`/`cfg(unix)`.
pub trait SystemAudioBackend: Send {
    /// Opens the device/file. Returns `false` on failure; the sender then
    /// runs in a dropped-audio, best-effort mode rather than failing mixer
    /// construction.
    fn open(&mut self, sample_rate: u32, channels: u16, bit_depth: u16) -> bool;

    /// Writes one chunk of already-downscaled bytes. Best-effort: write
    /// failures are logged, not propagated.
    fn write(&mut self, bytes: &[u8]);

    /// Returns the backend's effective format if it renegotiated away from
    /// what `open` was asked for (e.g. a device that only supports 44.1 kHz).
    /// `None` means the requested format was honored as-is.
    fn renegotiated_format(&self) -> Option<(u32, u16, u16)>;

    fn close(&mut self);
}

/// Writes raw interleaved PCM to a file or named pipe. This is the backend
/// every platform gets, used directly when `output_ip` says "loopback" and
/// as the fallback when no platform-specific backend is compiled in.
pub struct FifoBackend {
    path: String,
    file: Option<File>,
}

impl FifoBackend {
    #[must_use]
    pub fn new(path: String) -> Self {
        Self { path, file: None }
    }
}

impl SystemAudioBackend for FifoBackend {
    fn open(&mut self, _sample_rate: u32, _channels: u16, _bit_depth: u16) -> bool {
        match OpenOptions::new().create(true).write(true).open(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                true
            }
            Err(err) => {
                warn!("fifo backend failed to open {}: {err}", self.path);
                false
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Some(file) = &mut self.file {
            if let Err(err) = file.write_all(bytes) {
                warn!("fifo backend write to {} failed: {err}", self.path);
            }
        }
    }

    fn renegotiated_format(&self) -> Option<(u32, u16, u16)> {
        None
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[must_use]
fn is_loopback_target(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Picks the backend for a given `output_ip`: loopback addresses always get
/// the FIFO backend; everything else gets whatever platform backend was
/// compiled in, falling back to FIFO when none was.
#[must_use]
pub fn select_backend(output_ip: IpAddr, fifo_path: String) -> Box<dyn SystemAudioBackend> {
    if is_loopback_target(output_ip) {
        return Box::new(FifoBackend::new(fifo_path));
    }
    platform_backend().unwrap_or_else(|| Box::new(FifoBackend::new(fifo_path)))
}

#[cfg(target_os = "linux")]
fn platform_backend() -> Option<Box<dyn SystemAudioBackend>> {
    // A real ALSA backend lives behind the `alsa-backend` feature in the
    // host application; this crate only needs the seam.
    None
}

#[cfg(target_os = "windows")]
fn platform_backend() -> Option<Box<dyn SystemAudioBackend>> {
    // A real WASAPI backend lives behind the `wasapi-backend` feature in
    // the host application; this crate only needs the seam.
    None
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn platform_backend() -> Option<Box<dyn SystemAudioBackend>> {
    None
}

pub struct SystemAudioSender {
    sink_id: String,
    output_ip: IpAddr,
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
    fifo_path: String,
    backend: Mutex<Option<Box<dyn SystemAudioBackend>>>,
    renegotiated: Mutex<Option<(u32, u16, u16)>>,
    closed: AtomicBool,
}

impl SystemAudioSender {
    #[must_use]
    pub fn new(
        sink_id: String,
        output_ip: IpAddr,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
        fifo_path: String,
    ) -> Self {
        Self {
            sink_id,
            output_ip,
            sample_rate,
            channels,
            bit_depth,
            fifo_path,
            backend: Mutex::new(None),
            renegotiated: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The effective `(sample_rate, channels, bit_depth)` after any backend
    /// renegotiation during `setup`, falling back to the originally
    /// requested format when the backend didn't renegotiate. Exposed for
    /// host-side introspection; the mixer itself reads the raw
    /// [`NetworkSender::renegotiated_format`] through the trait object, via
    /// [`SinkMixer::update_playback_format_from_sender`](crate::mixer::SinkMixer::update_playback_format_from_sender).
    #[must_use]
    pub fn effective_format(&self) -> (u32, u16, u16) {
        (*self.renegotiated.lock()).unwrap_or((self.sample_rate, self.channels, self.bit_depth))
    }
}

impl NetworkSender for SystemAudioSender {
    fn setup(&mut self) -> bool {
        let mut backend = select_backend(self.output_ip, self.fifo_path.clone());
        let opened = backend.open(self.sample_rate, self.channels, self.bit_depth);
        if !opened {
            warn!("system audio backend failed to open for sink {}", self.sink_id);
        }
        *self.renegotiated.lock() = backend.renegotiated_format();
        *self.backend.lock() = Some(backend);
        // best-effort: the mixer continues even when the device refused to
        // open, matching the spec's "may renegotiate" rather than "must
        // succeed" framing for this variant.
        true
    }

    fn send_payload(&self, bytes: &[u8], _csrcs: &CsrcSet) {
        if let Some(backend) = self.backend.lock().as_mut() {
            backend.write(bytes);
        }
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut backend) = self.backend.lock().take() {
            backend.close();
        }
    }

    fn renegotiated_format(&self) -> Option<(u32, u16, u16)> {
        *self.renegotiated.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn loopback_ip_selects_fifo_backend() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(is_loopback_target(ip));
    }

    #[test]
    fn non_loopback_ip_is_not_loopback() {
        let ip: IpAddr = "192.168.1.5".parse().unwrap();
        assert!(!is_loopback_target(ip));
    }

    #[test]
    fn fifo_backend_round_trips_bytes() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();
        let mut backend = FifoBackend::new(path);
        assert!(backend.open(48_000, 2, 16));
        backend.write(&[1, 2, 3, 4]);
        backend.close();
    }

    #[test]
    fn close_before_setup_is_safe() {
        let mut sender = SystemAudioSender::new(
            "local".into(),
            "127.0.0.1".parse().unwrap(),
            48_000,
            2,
            16,
            "/tmp/sinkmixer-test-fifo".into(),
        );
        sender.close();
        sender.close();
    }
}
