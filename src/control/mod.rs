//! Administrative control surface.

pub mod surface;
