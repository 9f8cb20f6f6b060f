pub mod attributes;
pub mod component;
pub mod errors;
pub mod module;
pub mod placement;
pub mod random;
pub mod state;
pub mod tensor;

pub use attributes::*;
pub use component::*;
pub use errors::*;
pub use module::*;
pub use placement::*;
pub use random::*;
pub use state::*;
pub use tensor::*;
