//! CPAL output stream sink.
//!
//! CPAL streams are not `Send` on every host, so the stream lives on a dedicated thread
//! that owns it from creation to drop. The sink talks to that thread over a command
//! channel and waits for each reply.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use sonan_types::OutputFormat;

use crate::device;
use crate::error::{EngineError, EngineResult};
use crate::format::{AudioFormat, OutputSpec};
use crate::output::Renderer;

use super::RenderSink;

enum DeviceCommand {
    Start(Arc<Renderer>, Sender<EngineResult<()>>),
    Play(Sender<EngineResult<()>>),
    Pause(Sender<EngineResult<()>>),
    Stop,
}

pub struct DeviceSink {
    spec: OutputSpec,
    cmd_tx: Sender<DeviceCommand>,
    join: Option<JoinHandle<()>>,
}

impl DeviceSink {
    /// Pick the device and a stream config close to `source`, on the stream thread.
    pub fn open(name: Option<String>, source: &AudioFormat, encoding: OutputFormat) -> EngineResult<Self> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let target_rate = source.sample_rate;
        let join = thread::Builder::new()
            .name("sonan-output".to_string())
            .spawn(move || stream_thread(name, target_rate, encoding, ready_tx, cmd_rx))
            .map_err(|e| EngineError::output(format!("output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(spec)) => Ok(Self {
                spec,
                cmd_tx,
                join: Some(join),
            }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(EngineError::output("output thread exited during setup"))
            }
        }
    }

    fn request(&self, make: impl FnOnce(Sender<EngineResult<()>>) -> DeviceCommand) -> EngineResult<()> {
        let (tx, rx) = bounded(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| EngineError::output("output thread is gone"))?;
        rx.recv()
            .map_err(|_| EngineError::output("output thread is gone"))?
    }
}

impl RenderSink for DeviceSink {
    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn start(&mut self, renderer: Arc<Renderer>) -> EngineResult<()> {
        self.request(|reply| DeviceCommand::Start(renderer, reply))
    }

    fn pause(&mut self) -> EngineResult<()> {
        self.request(DeviceCommand::Pause)
    }

    fn resume(&mut self) -> EngineResult<()> {
        self.request(DeviceCommand::Play)
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(DeviceCommand::Stop);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("output thread panicked");
            }
        }
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.stop();
    }
}

type Setup = EngineResult<OutputSpec>;

fn stream_thread(
    name: Option<String>,
    target_rate: u32,
    encoding: OutputFormat,
    ready: Sender<Setup>,
    commands: Receiver<DeviceCommand>,
) {
    let host = cpal::default_host();
    let setup = (|| -> Result<_> {
        let device = device::pick_device(&host, name.as_deref())?;
        let config = device::pick_output_config(&device, Some(target_rate), encoding)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }
        let encoding = device::output_format_for(config.sample_format())
            .ok_or_else(|| anyhow!("Unsupported sample format: {:?}", config.sample_format()))?;
        Ok((device, stream_config, encoding))
    })();

    let (device, stream_config, encoding) = match setup {
        Ok(v) => v,
        Err(e) => {
            let _ = ready.send(Err(EngineError::output(format!("{e:#}"))));
            return;
        }
    };
    let device_name = device
        .description()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let spec = OutputSpec {
        sample_rate: stream_config.sample_rate,
        channels: stream_config.channels,
        encoding,
    };
    tracing::info!(
        device = %device_name,
        rate_hz = spec.sample_rate,
        channels = spec.channels,
        format = ?spec.encoding,
        buffer = ?stream_config.buffer_size,
        "output device selected"
    );
    if ready.send(Ok(spec)).is_err() {
        return;
    }

    let mut stream: Option<cpal::Stream> = None;
    for command in commands.iter() {
        match command {
            DeviceCommand::Start(renderer, reply) => {
                let result = build_output_stream(&device, &stream_config, encoding, renderer)
                    .map(|s| {
                        stream = Some(s);
                    })
                    .map_err(|e| EngineError::output(format!("{e:#}")));
                let _ = reply.send(result);
            }
            DeviceCommand::Play(reply) => {
                let result = match &stream {
                    Some(s) => s.play().map_err(EngineError::output),
                    None => Err(EngineError::output("stream not started")),
                };
                let _ = reply.send(result);
            }
            DeviceCommand::Pause(reply) => {
                let result = match &stream {
                    Some(s) => s.pause().map_err(EngineError::output),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            DeviceCommand::Stop => break,
        }
    }
    drop(stream);
    tracing::debug!("output stream closed");
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    encoding: OutputFormat,
    renderer: Arc<Renderer>,
) -> Result<cpal::Stream> {
    match encoding {
        OutputFormat::F32 => build_stream::<f32>(device, config, renderer),
        OutputFormat::I16 => build_stream::<i16>(device, config, renderer),
        OutputFormat::I32 => build_stream::<i32>(device, config, renderer),
    }
}

/// Device sample types the renderer's native-endian bytes can be reinterpreted as.
trait NativeSample: cpal::SizedSample + Send + 'static {
    const BYTES: usize;
    fn from_ne_slice(bytes: &[u8]) -> Self;
}

impl NativeSample for f32 {
    const BYTES: usize = 4;
    fn from_ne_slice(b: &[u8]) -> Self {
        f32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl NativeSample for i16 {
    const BYTES: usize = 2;
    fn from_ne_slice(b: &[u8]) -> Self {
        i16::from_ne_bytes([b[0], b[1]])
    }
}

impl NativeSample for i32 {
    const BYTES: usize = 4;
    fn from_ne_slice(b: &[u8]) -> Self {
        i32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }
}

/// The callback renders into a byte scratch buffer and reinterprets it as `T`.
///
/// The scratch buffer only grows when the host asks for a larger block than before.
fn build_stream<T: NativeSample>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    renderer: Arc<Renderer>,
) -> Result<cpal::Stream> {
    let mut scratch: Vec<u8> = Vec::new();
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let need = data.len() * T::BYTES;
            if scratch.len() < need {
                scratch.resize(need, 0);
            }
            renderer.render(&mut scratch[..need]);
            for (dst, src) in data.iter_mut().zip(scratch[..need].chunks_exact(T::BYTES)) {
                *dst = T::from_ne_slice(src);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
