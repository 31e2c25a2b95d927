mod caller_scope;
mod device_signature;
mod device_tokenizer;

pub use caller_scope::*;
pub use device_signature::*;
pub use device_tokenizer::*;

#[cfg(any(test, feature = "testing"))]
pub use caller_scope::MockCallerAuthenticator;
