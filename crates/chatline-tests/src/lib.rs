//! In-process relay harness and end-to-end flows for chatline.

pub mod harness;
