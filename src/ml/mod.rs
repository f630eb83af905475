pub mod alignment;
pub mod hmm;
pub mod persistence;
