//! The mutual-authentication handshake.
//!
//! Three records: ClientHello (plaintext), ServerHelloFinished,
//! ClientFinished. Both sides keep a running BLAKE2b transcript and absorb
//! the same bytes in the same order; each side proves its long-term identity
//! by signing the transcript at its prescribed point, with the signature
//! message encrypted under its freshly derived sending key. The nonce a
//! side announces in its hello is the initial counter of its sending
//! direction and is consumed once right here, by that signature message.

use tokio::io::{AsyncRead, AsyncWrite};

use lanshare_crypto::{
    identity, kx, random_bytes, Hash256, KexKeypair, OpeningKey, SealingKey, NONCE_LEN,
};
use lanshare_proto::handshake::{
    ClientFinished, ClientHello, ServerHelloFinished, SignatureMessage,
    KEX_LEN, MAX_ENCRYPTED_SIGNATURE_LEN, RANDOM_LEN,
};
use lanshare_proto::Wire;
use lanshare_types::PeerId;

use crate::record::{read_record, write_record};
use crate::SessionError;

/// This agent's long-term keypair, as loaded from the store.
#[derive(Clone)]
pub struct LocalIdentity {
    pub peer: PeerId,
    pub secret: [u8; identity::SECRET_KEY_LEN],
}

/// A completed handshake: who the peer is and the two channel directions.
pub struct Established {
    pub peer: PeerId,
    pub tx: SealingKey,
    pub rx: OpeningKey,
    /// Final transcript hash; both sides hold the same value.
    pub transcript: [u8; 32],
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], SessionError> {
    bytes.try_into().map_err(|_| SessionError::BadHandshakeField)
}

fn check_encrypted_signature(bytes: &[u8]) -> Result<(), SessionError> {
    if bytes.is_empty() || bytes.len() > MAX_ENCRYPTED_SIGNATURE_LEN {
        return Err(SessionError::BadHandshakeField);
    }
    Ok(())
}

async fn read_handshake_record<S>(stream: &mut S) -> Result<Vec<u8>, SessionError>
where
    S: AsyncRead + Unpin,
{
    read_record(stream)
        .await?
        .ok_or(SessionError::ClosedInHandshake)
}

/// Run the dialing side. `expected` is the contact being dialed; a server
/// that proves a different identity is rejected.
pub async fn connect<S>(
    stream: &mut S,
    local: &LocalIdentity,
    expected: PeerId,
) -> Result<Established, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transcript = Hash256::transcript();

    let random: [u8; RANDOM_LEN] = random_bytes()?;
    let kex = KexKeypair::generate()?;
    let nonce: [u8; NONCE_LEN] = random_bytes()?;

    let hello = ClientHello {
        random: random.to_vec(),
        kex_share: kex.public().to_vec(),
        nonce: nonce.to_vec(),
    };
    write_record(stream, &hello.encode()).await?;
    transcript.update(&random);
    transcript.update(kex.public());
    transcript.update(&nonce);

    let shf = ServerHelloFinished::decode(&read_handshake_record(stream).await?)?;
    let server_random: [u8; RANDOM_LEN] = fixed(&shf.random)?;
    let server_kex: [u8; KEX_LEN] = fixed(&shf.kex_share)?;
    let server_nonce: [u8; NONCE_LEN] = fixed(&shf.nonce)?;
    check_encrypted_signature(&shf.encrypted_signature)?;

    let keys = kx::client_session_keys(&kex, &server_kex)?;
    transcript.update(&server_random);
    transcript.update(&server_kex);
    transcript.update(&server_nonce);

    let mut rx = OpeningKey::new(&keys.rx, server_nonce);
    let sig_msg = SignatureMessage::decode(&rx.open(&shf.encrypted_signature)?)?;
    let server_pub: [u8; 32] = fixed(&sig_msg.pubkey)?;

    // Identity goes into the transcript before the signature over it is
    // checked; the signature therefore binds the key to this very session.
    transcript.update(&server_pub);
    identity::verify(&server_pub, &transcript.snapshot(), &sig_msg.signature)?;

    let peer = PeerId(server_pub);
    if peer != expected {
        return Err(SessionError::PeerMismatch);
    }

    transcript.update(local.peer.as_bytes());
    let final_hash = transcript.finalize();
    let signature = identity::sign(&local.secret, &final_hash)?;

    let mut tx = SealingKey::new(&keys.tx, nonce);
    let finished = ClientFinished {
        encrypted_signature: tx.seal(
            &SignatureMessage {
                pubkey: local.peer.as_bytes().to_vec(),
                signature: signature.to_vec(),
            }
            .encode(),
        ),
    };
    write_record(stream, &finished.encode()).await?;

    Ok(Established {
        peer,
        tx,
        rx,
        transcript: final_hash,
    })
}

/// Run the accepting side. The client's identity is whatever key its
/// signature proves; whether that key is trusted is the caller's question.
pub async fn accept<S>(stream: &mut S, local: &LocalIdentity) -> Result<Established, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transcript = Hash256::transcript();

    let hello = ClientHello::decode(&read_handshake_record(stream).await?)?;
    let client_random: [u8; RANDOM_LEN] = fixed(&hello.random)?;
    let client_kex: [u8; KEX_LEN] = fixed(&hello.kex_share)?;
    let client_nonce: [u8; NONCE_LEN] = fixed(&hello.nonce)?;

    transcript.update(&client_random);
    transcript.update(&client_kex);
    transcript.update(&client_nonce);

    let random: [u8; RANDOM_LEN] = random_bytes()?;
    let kex = KexKeypair::generate()?;
    let nonce: [u8; NONCE_LEN] = random_bytes()?;
    let keys = kx::server_session_keys(&kex, &client_kex)?;

    transcript.update(&random);
    transcript.update(kex.public());
    transcript.update(&nonce);
    transcript.update(local.peer.as_bytes());

    let signature = identity::sign(&local.secret, &transcript.snapshot())?;
    let mut tx = SealingKey::new(&keys.tx, nonce);
    let shf = ServerHelloFinished {
        random: random.to_vec(),
        kex_share: kex.public().to_vec(),
        nonce: nonce.to_vec(),
        encrypted_signature: tx.seal(
            &SignatureMessage {
                pubkey: local.peer.as_bytes().to_vec(),
                signature: signature.to_vec(),
            }
            .encode(),
        ),
    };
    write_record(stream, &shf.encode()).await?;

    let finished = ClientFinished::decode(&read_handshake_record(stream).await?)?;
    check_encrypted_signature(&finished.encrypted_signature)?;

    let mut rx = OpeningKey::new(&keys.rx, client_nonce);
    let sig_msg = SignatureMessage::decode(&rx.open(&finished.encrypted_signature)?)?;
    let client_pub: [u8; 32] = fixed(&sig_msg.pubkey)?;

    transcript.update(&client_pub);
    let final_hash = transcript.finalize();
    identity::verify(&client_pub, &final_hash, &sig_msg.signature)?;

    Ok(Established {
        peer: PeerId(client_pub),
        tx,
        rx,
        transcript: final_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_pair() -> LocalIdentity {
        let (public, secret) = identity::generate().unwrap();
        LocalIdentity {
            peer: PeerId(public),
            secret,
        }
    }

    async fn run_pair(
        client: LocalIdentity,
        server: LocalIdentity,
        expected: PeerId,
    ) -> (
        Result<Established, SessionError>,
        Result<Established, SessionError>,
    ) {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(async move { accept(&mut b, &server).await });
        let client_result = connect(&mut a, &client, expected).await;
        // Closing the client end unblocks a server still waiting on a
        // ClientFinished that will never come.
        drop(a);
        let server_result = server_task.await.unwrap();
        (client_result, server_result)
    }

    #[tokio::test]
    async fn both_sides_agree() {
        let client = identity_pair();
        let server = identity_pair();
        let (c, s) = run_pair(client.clone(), server.clone(), server.peer).await;
        let c = c.unwrap();
        let s = s.unwrap();

        assert_eq!(c.peer, server.peer);
        assert_eq!(s.peer, client.peer);
        assert_eq!(c.transcript, s.transcript);
        // Each side consumed exactly one nonce per direction.
        assert_eq!(c.tx.nonce(), s.rx.nonce());
        assert_eq!(c.rx.nonce(), s.tx.nonce());
    }

    #[tokio::test]
    async fn channels_work_after_handshake() {
        let client = identity_pair();
        let server = identity_pair();
        let (c, s) = run_pair(client, server.clone(), server.peer).await;
        let mut c = c.unwrap();
        let mut s = s.unwrap();

        let ct = c.tx.seal(b"from client");
        assert_eq!(s.rx.open(&ct).unwrap(), b"from client");
        let ct = s.tx.seal(b"from server");
        assert_eq!(c.rx.open(&ct).unwrap(), b"from server");
    }

    #[tokio::test]
    async fn wrong_server_identity_is_rejected() {
        let client = identity_pair();
        let server = identity_pair();
        let impostor_expectation = identity_pair().peer;
        let (c, _s) = run_pair(client, server, impostor_expectation).await;
        assert!(matches!(c, Err(SessionError::PeerMismatch)));
    }

    #[tokio::test]
    async fn server_rejects_garbage_hello() {
        let server = identity_pair();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { accept(&mut b, &server).await });
        // A syntactically valid record whose hello fields have wrong sizes.
        let bogus = ClientHello {
            random: vec![1; 8],
            kex_share: vec![2; 8],
            nonce: vec![3; 8],
        };
        write_record(&mut a, &bogus.encode()).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::BadHandshakeField)
        ));
    }

    #[tokio::test]
    async fn closed_before_hello_is_an_error() {
        let server = identity_pair();
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        assert!(matches!(
            accept(&mut b, &server).await,
            Err(SessionError::ClosedInHandshake)
        ));
    }
}
