use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::format::OutputSpec;
use crate::output::Renderer;

use super::RenderSink;

const FRAMES_PER_TICK: usize = 512;

/// Renders in real time and throws the audio away.
pub struct NullSink {
    spec: OutputSpec,
    paused: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl NullSink {
    pub fn new(spec: OutputSpec) -> Self {
        Self {
            spec,
            paused: Arc::new(AtomicBool::new(true)),
            cancel: Arc::new(AtomicBool::new(false)),
            join: None,
        }
    }
}

impl RenderSink for NullSink {
    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn start(&mut self, renderer: Arc<Renderer>) -> EngineResult<()> {
        let spec = self.spec;
        let paused = self.paused.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_secs_f64(FRAMES_PER_TICK as f64 / f64::from(spec.sample_rate.max(1)));
        let join = thread::Builder::new()
            .name("sonan-null-sink".to_string())
            .spawn(move || {
                let mut bytes = vec![0u8; FRAMES_PER_TICK * spec.bytes_per_frame()];
                let mut next = Instant::now();
                while !cancel.load(Ordering::Acquire) {
                    if !paused.load(Ordering::Acquire) {
                        renderer.render(&mut bytes);
                    }
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| EngineError::output(format!("null sink thread: {e}")))?;
        self.join = Some(join);
        Ok(())
    }

    fn pause(&mut self) -> EngineResult<()> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    fn resume(&mut self) -> EngineResult<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
