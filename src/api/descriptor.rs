use uuid::Uuid;

#[derive(Debug, Ord, Clone, PartialOrd, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub permissions: Vec<AttributePermission>,
    pub value: Option<Vec<u8>>,
    pub convenience_name: Option<String>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor {
            uuid: Uuid::nil(),
            permissions: vec![
                AttributePermission::Readable,
                AttributePermission::Writeable,
            ],
            value: None,
            convenience_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, PartialEq, Eq, Hash)]
pub enum AttributePermission {
    Readable,
    Writeable,
}
