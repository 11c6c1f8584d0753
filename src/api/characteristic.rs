use uuid::Uuid;

use crate::api::descriptor::Descriptor;

/// Fixture description of a characteristic exposed by a simulated peripheral.
#[derive(Debug, Ord, Eq, PartialEq, PartialOrd, Clone)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: Vec<CharacteristicProperty>,
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<Descriptor>,
    pub convenience_name: Option<String>,
}

impl Default for Characteristic {
    fn default() -> Self {
        Characteristic {
            uuid: Uuid::nil(),
            properties: vec![
                CharacteristicProperty::Read,
                CharacteristicProperty::Write,
                CharacteristicProperty::WriteWithoutResponse,
            ],
            value: None,
            descriptors: Vec::new(),
            convenience_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Eq, PartialEq, Hash)]
pub enum CharacteristicProperty {
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Eq, PartialEq, Hash)]
pub enum CharacteristicWriteType {
    WriteWithoutResponse,
    WriteWithResponse,
}

impl CharacteristicWriteType {
    pub fn from_with_response(with_response: bool) -> Self {
        if with_response {
            CharacteristicWriteType::WriteWithResponse
        } else {
            CharacteristicWriteType::WriteWithoutResponse
        }
    }

    pub(crate) fn required_property(self) -> CharacteristicProperty {
        match self {
            CharacteristicWriteType::WriteWithResponse => CharacteristicProperty::Write,
            CharacteristicWriteType::WriteWithoutResponse => {
                CharacteristicProperty::WriteWithoutResponse
            }
        }
    }
}
