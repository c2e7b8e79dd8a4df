pub mod coqui;
pub mod madlad;
pub mod model;
pub mod whisper;
