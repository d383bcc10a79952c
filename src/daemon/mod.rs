//! Background drivers that run alongside the controller.

pub mod ticker;
