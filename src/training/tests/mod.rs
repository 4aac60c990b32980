//! Test suite for the SimPO training pipeline
//!
//! Covers the loss, the data pipeline, the training loop and checkpointing,
//! using a bigram toy model small enough to train in milliseconds.

pub mod checkpoint_tests;
pub mod trainer_tests;

pub mod fixtures;
