//! Short public identifiers for uploaded files.

use rand::prelude::RngExt;
use rand::rng;

/// Length of identifiers handed out by the upload endpoint.
pub const DEFAULT_ID_LENGTH: usize = 8;

/// Generate a random lower-case hex identifier of exactly `length` characters.
///
/// The identifier is drawn from `ceil(length / 2)` bytes of the thread-local CSPRNG. Nothing
/// checks it against identifiers already handed out; at 8 characters the collision odds are
/// accepted as negligible.
pub fn generate(length: usize) -> String {
    let mut bytes = vec![0u8; length.div_ceil(2)];
    rng().fill(bytes.as_mut_slice());

    let mut id: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    id.truncate(length);
    id
}
