//! dialserver - Surface Dial to WebSocket bridge
//!
//! Reads a rotary dial (rotation + push button) and pushes debounced,
//! aggregated JSON events to every connected WebSocket consumer.
//!
//! This library provides:
//! - Report decoding for packetized HID and streamed input-event devices
//! - Button debounce and time-windowed rotation aggregation
//! - Device discovery, session handling and reconnection with backoff
//! - A broadcast hub with heartbeat-based consumer eviction
//! - A debug web page that prints the live event stream

pub mod aggregator;
pub mod config;
pub mod device;
pub mod hub;
pub mod protocol;
pub mod web;
