use lanshare_types::PeerId;

/// One row of the contact list as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRow {
    pub peer: PeerId,
    pub name: String,
    pub static_host: Option<String>,
}
