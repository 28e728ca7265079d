pub mod controller;
pub mod reducer;
pub mod sampler;

pub use controller::TrackingController;
pub use reducer::IntervalReducer;
pub use sampler::SampleSource;
