use uuid::Uuid;

use crate::api::characteristic::Characteristic;

#[derive(Debug, Default, Ord, Eq, PartialEq, PartialOrd, Clone)]
pub struct Service {
    pub uuid: Uuid,
    /// Advertised services are appended to the peripheral's advertisement.
    pub is_advertised: bool,
    pub characteristics: Vec<Characteristic>,
    pub convenience_name: Option<String>,
}
