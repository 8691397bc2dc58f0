pub mod engine;
pub mod token;

pub use engine::{PassReport, RelinkOutcome, SummonResponse, TetherEngine};
pub use token::BindingToken;
