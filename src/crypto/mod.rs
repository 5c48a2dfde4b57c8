pub mod keypair;

pub use keypair::Keypair;
