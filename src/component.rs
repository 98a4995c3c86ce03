//! Defines the Component trait, implemented by each PlaneScope processing
//! stage. A component consumes one unit of data, converts it, and hands the
//! result to whatever follows it in the pipeline. The runners here put a
//! component on its own thread, fed either by a channel or by the input
//! ring buffer of a [PipelineContext].

use crate::pipeline::PipelineContext;
use crate::ring_buffer::RingBufferError;
use log::{debug, info, warn};
use std::fmt::{self, Display};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Failures a component reports while shutting down or reading input.
#[derive(Debug)]
pub enum ComponentError {
    HoundError(hound::Error),
    RingBufferError(RingBufferError),
}

impl Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::HoundError(e) => write!(f, "wav error: {}", e),
            ComponentError::RingBufferError(e) => write!(f, "ring buffer error: {}", e),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<hound::Error> for ComponentError {
    fn from(value: hound::Error) -> Self {
        Self::HoundError(value)
    }
}

impl From<RingBufferError> for ComponentError {
    fn from(value: RingBufferError) -> Self {
        Self::RingBufferError(value)
    }
}

///
/// A stage in the PlaneScope pipeline. Every struct that performs a
/// processing step implements Component, so that the runners below can
/// drive it on its own thread.
///
pub trait Component: Display {
    type InData;
    type OutData;

    /// Converts one input into one output
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up at termination of the pipeline
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

fn finish<C: Component>(component: &mut C) {
    if let Err(component_error) = component.finalize() {
        warn!("{} : error during terminating : {}.", component, component_error);
    }
    info!("{} : terminated.", component);
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel. Stops when the input channel
/// closes.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            if output.send(out_data).is_err() {
                debug!("{} : output closed.", component);
            }
        }
        finish(component.as_mut());
    })
}

/// Runs the given Component on its own thread, feeding it windows of
/// `window_frames` interleaved frames from the context's input buffer.
///
/// Each wait is bounded by `timeout`, so the loop notices cancellation
/// promptly. The loop ends when the context is cancelled, when the
/// producer has finished and less than a window is left, or when nobody
/// is listening on `output` any more.
pub fn run_windowed<C: Component<InData = Vec<f32>> + Send + 'static>(
    mut component: Box<C>,
    ctx: Arc<PipelineContext>,
    window_frames: usize,
    timeout: Duration,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while !ctx.is_done() {
            if !ctx.input().wait_for_read(window_frames, timeout) {
                if ctx.capture_finished() && ctx.input().available_read() < window_frames {
                    break;
                }
                debug!("{} : timed out waiting for a window.", component);
                continue;
            }
            let window = match ctx.input().read(window_frames) {
                Ok(window) => window,
                Err(error) => {
                    warn!("{} : {}.", component, error);
                    continue;
                }
            };
            if output.send(component.convert(window)).is_err() {
                debug!("{} : output closed.", component);
                break;
            }
        }
        finish(component.as_mut());
    })
}
