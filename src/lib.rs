//! PlaneScope tracks a single sound source with a small microphone array
//! and reports where on a known surface, such as a wall or the floor, the
//! sound is coming from.
//!
//! Audio arrives in blocks from a [capture] source and is queued in a
//! [ring_buffer]. The tracking stage of the [pipeline] takes fixed-size
//! windows off the queue, turns them into per-channel spectra
//! ([spectrum]), and feeds them to one or more von Mises particle filters
//! ([tracker]). Each filter keeps a weighted cloud of candidate directions;
//! its estimate is dropped onto a plane of the [search_space] to give a
//! position in the room.
//!
//! Several filters with different outlier probabilities can run side by
//! side on the same audio, which makes it easy to see how much the outlier
//! model buys on intermittent or reverberant input. The `monitor` binary
//! plots their particle clouds live; the `planescope` binary logs their
//! estimates.

pub mod args;
pub mod capture;
pub mod component;
pub mod config;
pub mod geometry;
pub mod gui;
pub mod pipeline;
pub mod recorder;
pub mod ring_buffer;
pub mod search_space;
pub mod spectrum;
pub mod tracker;
pub mod vector;
pub mod von_mises;

pub use vector::Vec3;
