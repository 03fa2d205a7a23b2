//! Wan DiT model modules

pub mod attention;
pub mod dit;
pub mod embeddings;
pub mod feed_forward;
pub mod modulation;
pub mod normalization;
pub mod patch;
pub mod rope;
