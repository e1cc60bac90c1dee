//! Metric learning components: distances, reducers and the losses built on them

pub mod distances;
pub mod losses;
pub mod reducers;

pub use distances::*;
pub use losses::*;
pub use reducers::*;
