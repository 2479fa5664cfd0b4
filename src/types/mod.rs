pub mod heartrate;

pub use heartrate::Sample;
