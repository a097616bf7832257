use anyhow::{anyhow, Result};
use rusqlite::OptionalExtension;
use tracing::info;

use lanshare_crypto::identity;
use lanshare_types::PeerId;

use crate::models::ContactRow;
use crate::Database;

impl Database {
    // -- Identity --

    /// The agent's long-term keypair, generated and persisted on first run.
    pub fn identity(&self) -> Result<(PeerId, [u8; identity::SECRET_KEY_LEN])> {
        self.with_conn(|conn| {
            let row: Option<(Vec<u8>, Vec<u8>)> = conn
                .query_row("SELECT pubkey, privkey FROM keys LIMIT 1", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;

            let (pubkey, privkey) = match row {
                Some(row) => row,
                None => {
                    let (public, secret) = identity::generate()?;
                    conn.execute(
                        "INSERT INTO keys (pubkey, privkey) VALUES (?1, ?2)",
                        (public.as_slice(), secret.as_slice()),
                    )?;
                    info!("generated new identity keypair");
                    (public.to_vec(), secret.to_vec())
                }
            };

            let peer = PeerId::from_slice(&pubkey)
                .ok_or_else(|| anyhow!("stored public key has wrong length"))?;
            let secret: [u8; identity::SECRET_KEY_LEN] = privkey
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("stored secret key has wrong length"))?;
            Ok((peer, secret))
        })
    }

    // -- Contacts --

    pub fn list_contacts(&self) -> Result<Vec<ContactRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT pubkey, name, static_host FROM contacts ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;

            let mut contacts = Vec::new();
            for row in rows {
                let (pubkey, name, static_host) = row?;
                let peer = PeerId::from_slice(&pubkey)
                    .ok_or_else(|| anyhow!("stored contact key has wrong length"))?;
                contacts.push(ContactRow {
                    peer,
                    name,
                    static_host,
                });
            }
            Ok(contacts)
        })
    }

    pub fn add_contact(&self, peer: PeerId, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (name, pubkey) VALUES (?1, ?2)",
                (name, peer.as_bytes().as_slice()),
            )?;
            Ok(())
        })
    }

    pub fn update_contact_name(&self, peer: PeerId, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE contacts SET name = ?1 WHERE pubkey = ?2",
                (name, peer.as_bytes().as_slice()),
            )?;
            if changed == 0 {
                return Err(anyhow!("no contact with key {peer}"));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("store.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn identity_is_generated_once() {
        let (_dir, db) = open_temp();
        let (peer_a, secret_a) = db.identity().unwrap();
        let (peer_b, secret_b) = db.identity().unwrap();
        assert_eq!(peer_a, peer_b);
        assert_eq!(secret_a, secret_b);
        // The keypair encoding embeds the public half.
        assert_eq!(&secret_a[32..], peer_a.as_bytes());
    }

    #[test]
    fn contact_roundtrip() {
        let (_dir, db) = open_temp();
        let peer = PeerId([5u8; 32]);
        db.add_contact(peer, "laptop").unwrap();

        let contacts = db.list_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].peer, peer);
        assert_eq!(contacts[0].name, "laptop");
        assert_eq!(contacts[0].static_host, None);

        db.update_contact_name(peer, "work laptop").unwrap();
        assert_eq!(db.list_contacts().unwrap()[0].name, "work laptop");
    }

    #[test]
    fn duplicate_contact_rejected() {
        let (_dir, db) = open_temp();
        let peer = PeerId([6u8; 32]);
        db.add_contact(peer, "a").unwrap();
        assert!(db.add_contact(peer, "b").is_err());
    }

    #[test]
    fn rename_unknown_contact_fails() {
        let (_dir, db) = open_temp();
        assert!(db.update_contact_name(PeerId([7u8; 32]), "x").is_err());
    }
}
