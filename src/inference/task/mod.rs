pub mod synthesize;
pub mod transcribe;
pub mod translate;
