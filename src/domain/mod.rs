pub mod fleet_service;
pub mod monitoring;
pub mod node;

/// Random 128-bit record identifier, hex encoded.
pub fn new_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
