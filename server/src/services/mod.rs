pub mod checkpointer;
pub mod reconstructor;
pub mod scanner;
