pub mod analyser;
pub mod detector;
pub mod level;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};

/// Capacity of the capture ring buffer (about 1s at 48 kHz)
const CAPTURE_RING_CAPACITY: usize = 48_000;

/// Device information for enumeration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub host: String,
    pub max_channels: u16,
    pub sample_rates: Vec<u32>,
}

/// Friendly error message with optional error code
#[derive(Debug, Clone, Serialize)]
pub struct FriendlyError {
    pub message: String,
    pub code: String,
    pub technical: String,
}

/// Map common CPAL/audio errors to user-friendly messages
pub fn friendly_audio_error(error: &anyhow::Error) -> FriendlyError {
    let error_str = format!("{:#}", error);
    let error_lower = error_str.to_lowercase();

    let (message, code) = if error_lower.contains("device busy")
        || error_lower.contains("in use")
        || error_lower.contains("already in use")
    {
        (
            "Another app is using this microphone. Close other audio apps and try again.",
            "device_busy",
        )
    } else if error_lower.contains("permission")
        || error_lower.contains("access denied")
        || error_lower.contains("denied")
    {
        (
            "Microphone access denied. Check your system's microphone settings.",
            "permission_denied",
        )
    } else if error_lower.contains("no such device")
        || error_lower.contains("not found")
        || error_lower.contains("does not exist")
        || error_lower.contains("disconnected")
    {
        (
            "Microphone was unplugged or is no longer available. Please reconnect it.",
            "device_not_found",
        )
    } else if error_lower.contains("timeout") || error_lower.contains("timed out") {
        (
            "Audio device timed out. Try unplugging and reconnecting it.",
            "timeout",
        )
    } else if error_lower.contains("no default")
        || error_lower.contains("no input device")
        || error_lower.contains("no microphone")
    {
        ("No microphone found. Please connect a microphone.", "no_device")
    } else {
        (
            "Audio system error. Try restarting clap detection or reconnecting your microphone.",
            "unknown",
        )
    };

    FriendlyError {
        message: message.to_string(),
        code: code.to_string(),
        technical: error_str,
    }
}

/// List all available input devices
pub fn list_input_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_device_name = host.default_input_device().and_then(|d| d.name().ok());
    let host_id = host.id().name();

    let mut devices = Vec::new();
    for device in host.input_devices()? {
        let Ok(name) = device.name() else {
            continue;
        };

        let (max_channels, sample_rates) = device
            .supported_input_configs()
            .ok()
            .and_then(|mut configs| configs.next())
            .map(|config| {
                (
                    config.channels(),
                    vec![config.min_sample_rate().0, config.max_sample_rate().0],
                )
            })
            .unwrap_or((1, vec![16000]));

        devices.push(DeviceInfo {
            is_default: Some(&name) == default_device_name.as_ref(),
            name,
            host: host_id.to_string(),
            max_channels,
            sample_rates,
        });
    }

    Ok(devices)
}

/// Source of microphone streams for the clap detector.
///
/// `open` is called on the detector's worker thread, so the returned stream
/// does not need to be `Send`.
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone once and release it immediately
    fn probe(&self) -> Result<()>;

    /// Acquire a live microphone stream
    fn open(&self) -> Result<Box<dyn CaptureStream>>;
}

/// A live capture stream delivering mono samples
pub trait CaptureStream {
    /// Move every sample captured since the last call into `out`
    fn read(&mut self, out: &mut Vec<f32>) -> Result<()>;

    /// Stop capturing and release the device
    fn disconnect(&mut self) -> Result<()>;
}

/// Microphone access through cpal
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Use the named input device, or the system default when `None`
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn resolve_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(ref name) = self.device_name {
            if let Some(device) = host
                .input_devices()?
                .find(|d| d.name().ok().as_deref() == Some(name.as_str()))
            {
                return Ok(device);
            }
            log::warn!("Input device '{}' not found, falling back to default", name);
        }

        host.default_input_device()
            .context("No default input device")
    }
}

impl AudioBackend for CpalBackend {
    fn probe(&self) -> Result<()> {
        let device = self.resolve_device()?;
        let config = device
            .default_input_config()
            .context("Failed to get default input config")?;

        let stream = device.build_input_stream_raw(
            &config.config(),
            config.sample_format(),
            |_data, _: &cpal::InputCallbackInfo| {},
            |err| log::warn!("Probe stream error: {}", err),
            None,
        )?;
        stream.play().context("Failed to start probe stream")?;
        drop(stream);

        log::debug!("Microphone probe succeeded");
        Ok(())
    }

    fn open(&self) -> Result<Box<dyn CaptureStream>> {
        Ok(Box::new(CpalCapture::open(self.resolve_device()?)?))
    }
}

/// cpal input stream feeding a lock-free ring buffer
struct CpalCapture {
    stream: Option<Stream>,
    samples: HeapCons<f32>,
    errors: Receiver<String>,
}

impl CpalCapture {
    fn open(device: cpal::Device) -> Result<Self> {
        log::info!("Using audio device: {}", device.name()?);

        let supported_config = device
            .default_input_config()
            .context("Failed to get default input config")?;

        log::info!(
            "Device config: {} Hz, {} channels, format: {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let stream_config = StreamConfig {
            channels: supported_config.channels(),
            sample_rate: supported_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = supported_config.channels() as usize;

        let (producer, consumer) = HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split();
        let (err_tx, err_rx) = bounded::<String>(8);

        let stream = match supported_config.sample_format() {
            SampleFormat::F32 => {
                build_stream(&device, &stream_config, channels, producer, err_tx, |s: f32| s)?
            }
            SampleFormat::I16 => {
                build_stream(&device, &stream_config, channels, producer, err_tx, |s: i16| {
                    s as f32 / i16::MAX as f32
                })?
            }
            SampleFormat::U16 => {
                build_stream(&device, &stream_config, channels, producer, err_tx, |s: u16| {
                    (s as f32 / u16::MAX as f32) * 2.0 - 1.0
                })?
            }
            format => anyhow::bail!("Unsupported sample format: {:?}", format),
        };

        stream.play().context("Failed to start input stream")?;
        log::info!("✓ Audio capture started");

        Ok(Self {
            stream: Some(stream),
            samples: consumer,
            errors: err_rx,
        })
    }
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut producer: HeapProd<f32>,
    err_tx: Sender<String>,
    to_f32: F,
) -> Result<Stream>
where
    T: cpal::SizedSample,
    F: Fn(T) -> f32 + Send + 'static,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Downmix to mono; drop samples when the worker falls behind
            for frame in data.chunks(channels) {
                let mono = frame.iter().map(|&s| to_f32(s)).sum::<f32>() / channels as f32;
                let _ = producer.try_push(mono);
            }
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            let _ = err_tx.try_send(err.to_string());
        },
        None,
    )?;
    Ok(stream)
}

impl CaptureStream for CpalCapture {
    fn read(&mut self, out: &mut Vec<f32>) -> Result<()> {
        if let Ok(err) = self.errors.try_recv() {
            anyhow::bail!("Input stream failed: {}", err);
        }
        if self.stream.is_none() {
            anyhow::bail!("Input stream is disconnected");
        }

        out.reserve(self.samples.occupied_len());
        out.extend(self.samples.pop_iter());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let paused = stream.pause().context("Failed to pause input stream");
        drop(stream);
        paused
    }
}
