//! The responder-side EAP conversation and the EAP-MSCHAPv2 method
//!
//! When a policy selects EAP, the responder withholds its AUTH payload
//! and runs one EAP round trip per sub-state: identity, challenge,
//! success acknowledgement. A completed method yields the MSK both
//! sides re-derive their final AUTH payloads from.

use rand::RngCore;
use zeroize::Zeroizing;

use ikewire::defs::params::EapCode;
use ikewire::defs::EapMessage;

use crate::policy::EapUser;
use crate::{Error, Result};

/// EAP method type: identity exchange
pub const EAP_TYPE_IDENTITY: u8 = 1;
/// EAP method type: MSCHAPv2
pub const EAP_TYPE_MSCHAPV2: u8 = 26;

const MSCHAP_OP_CHALLENGE: u8 = 1;
const MSCHAP_OP_RESPONSE: u8 = 2;
const MSCHAP_OP_SUCCESS: u8 = 3;
const MSCHAP_OP_FAILURE: u8 = 4;

/// Where the conversation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapPhase {
    /// Identity request is out
    IdentityRequested,
    /// MSCHAPv2 challenge is out
    ChallengeSent,
    /// Success request (the S= authenticator response) is out
    SuccessRequested,
    /// EAP Success sent, MSK available
    Completed,
}

/// Responder-side conversation state, parked on the IKE SA
pub struct EapState {
    /// Sub-state of the round trip machine
    pub phase: EapPhase,
    identifier: u8,
    challenge: [u8; 16],
    identity: String,
    msk: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for EapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EapState")
            .field("phase", &self.phase)
            .field("identity", &self.identity)
            .finish()
    }
}

/// What the engine should do with the peer's EAP response
pub enum EapStep {
    /// Send this request and wait for the next response
    Reply(EapMessage),
    /// Conversation finished: send EAP Success, MSK is on the state
    Success(EapMessage),
    /// Authentication failed: send EAP Failure and tear down
    Failure(EapMessage),
}

impl EapState {
    /// Open the conversation with an identity request
    pub fn start() -> (Self, EapMessage) {
        let state = Self {
            phase: EapPhase::IdentityRequested,
            identifier: 1,
            challenge: [0; 16],
            identity: String::new(),
            msk: None,
        };
        let request = EapMessage {
            code: EapCode::Request,
            identifier: 1,
            eap_type: Some(EAP_TYPE_IDENTITY),
            data: vec![],
        };
        (state, request)
    }

    /// The MSK of a completed conversation
    pub fn msk(&self) -> Option<&[u8]> {
        self.msk.as_deref().map(|v| v.as_slice())
    }

    /// Advance the conversation with a peer response
    pub fn handle(&mut self, users: &[EapUser], msg: &EapMessage) -> Result<EapStep> {
        if msg.code != EapCode::Response || msg.identifier != self.identifier {
            return Err(Error::Protocol("unexpected EAP message"));
        }
        match self.phase {
            EapPhase::IdentityRequested => {
                if msg.eap_type != Some(EAP_TYPE_IDENTITY) {
                    return Ok(EapStep::Failure(self.failure()));
                }
                self.identity = String::from_utf8(msg.data.clone())
                    .map_err(|_| Error::Protocol("EAP identity is not UTF-8"))?;
                rand::thread_rng().fill_bytes(&mut self.challenge);
                self.identifier = self.identifier.wrapping_add(1);
                self.phase = EapPhase::ChallengeSent;

                // Challenge-Packet: value size, challenge, our name
                let mut value = vec![16u8];
                value.extend_from_slice(&self.challenge);
                value.extend_from_slice(b"iked");
                Ok(EapStep::Reply(self.mschap(MSCHAP_OP_CHALLENGE, value)))
            }
            EapPhase::ChallengeSent => {
                let response = match parse_mschap(msg, MSCHAP_OP_RESPONSE) {
                    Some(r) => r,
                    None => return Ok(EapStep::Failure(self.failure())),
                };
                // Response-Packet value: size(49), peer challenge(16),
                // reserved(8), NT response(24), flags(1); name follows
                if response.len() < 50 || response[0] != 49 {
                    return Ok(EapStep::Failure(self.failure()));
                }
                let peer_challenge: [u8; 16] = response[1..17]
                    .try_into()
                    .map_err(|_| Error::Internal("slice arithmetic".into()))?;
                let nt_response = &response[25..49];

                let Some(user) = users.iter().find(|u| u.name == self.identity) else {
                    return Ok(EapStep::Failure(self.failure()));
                };
                let expected = mschap::nt_response(
                    &self.challenge,
                    &peer_challenge,
                    &self.identity,
                    &user.password,
                );
                if !crate::crypto::constant_time_eq(&expected, nt_response) {
                    return Ok(EapStep::Failure(self.failure()));
                }

                let authenticator = mschap::authenticator_response(
                    &user.password,
                    nt_response,
                    &peer_challenge,
                    &self.challenge,
                    &self.identity,
                );
                self.msk = Some(Zeroizing::new(
                    mschap::msk(&user.password, nt_response).to_vec(),
                ));
                self.identifier = self.identifier.wrapping_add(1);
                self.phase = EapPhase::SuccessRequested;
                Ok(EapStep::Reply(
                    self.mschap(MSCHAP_OP_SUCCESS, authenticator.into_bytes()),
                ))
            }
            EapPhase::SuccessRequested => {
                // the peer acknowledges with a bare success op code
                if msg.eap_type != Some(EAP_TYPE_MSCHAPV2)
                    || msg.data.first() != Some(&MSCHAP_OP_SUCCESS)
                {
                    return Ok(EapStep::Failure(self.failure()));
                }
                self.phase = EapPhase::Completed;
                Ok(EapStep::Success(EapMessage {
                    code: EapCode::Success,
                    identifier: self.identifier,
                    eap_type: None,
                    data: vec![],
                }))
            }
            EapPhase::Completed => Err(Error::Protocol("EAP conversation already finished")),
        }
    }

    /// Wrap an MSCHAPv2 op into an EAP request
    fn mschap(&self, op_code: u8, value: Vec<u8>) -> EapMessage {
        // op, MS-CHAPv2-ID, MS-Length, value
        let ms_length = (4 + value.len()) as u16;
        let mut data = vec![op_code, self.identifier];
        data.extend_from_slice(&ms_length.to_be_bytes());
        data.extend(value);
        EapMessage {
            code: EapCode::Request,
            identifier: self.identifier,
            eap_type: Some(EAP_TYPE_MSCHAPV2),
            data,
        }
    }

    fn failure(&self) -> EapMessage {
        EapMessage {
            code: EapCode::Failure,
            identifier: self.identifier,
            eap_type: None,
            data: vec![],
        }
    }
}

/// Extract the value part of an MSCHAPv2 packet with the expected op code
fn parse_mschap<'m>(msg: &'m EapMessage, op_code: u8) -> Option<&'m [u8]> {
    if msg.eap_type != Some(EAP_TYPE_MSCHAPV2) {
        return None;
    }
    let (&op, rest) = msg.data.split_first()?;
    if op != op_code || op == MSCHAP_OP_FAILURE {
        return None;
    }
    // skip MS-CHAPv2-ID and MS-Length
    rest.get(3..)
}

/// The MSCHAPv2 cryptography of RFC 2759 and the MSK derivation of
/// RFC 3079
pub mod mschap {
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};
    use des::Des;
    use md4::{Digest as _, Md4};
    use sha1::{Digest as _, Sha1};

    const MAGIC1: &[u8] = b"Magic server to client signing constant";
    const MAGIC2: &[u8] = b"Pad to make it do more than one iteration";
    const MPPE_MASTER: &[u8] = b"This is the MPPE Master Key";
    const MPPE_SEND: &[u8] = b"On the client side, this is the send key; on \
the server side, it is the receive key.";
    const MPPE_RECV: &[u8] = b"On the client side, this is the receive key; on \
the server side, it is the send key.";
    const SHS_PAD1: [u8; 40] = [0x00; 40];
    const SHS_PAD2: [u8; 40] = [0xf2; 40];

    /// `ChallengeHash`: the 8-octet challenge both responses derive from
    pub fn challenge_hash(
        peer_challenge: &[u8; 16],
        authenticator_challenge: &[u8; 16],
        username: &str,
    ) -> [u8; 8] {
        let mut sha = Sha1::new();
        sha.update(peer_challenge);
        sha.update(authenticator_challenge);
        sha.update(username.as_bytes());
        let digest = sha.finalize();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        out
    }

    /// `NtPasswordHash`: MD4 over the UTF-16LE password
    pub fn nt_password_hash(password: &str) -> [u8; 16] {
        let mut md4 = Md4::new();
        for unit in password.encode_utf16() {
            md4.update(unit.to_le_bytes());
        }
        md4.finalize().into()
    }

    /// Expand a 7-octet key half into a DES key with parity bit slots
    fn des_key(seven: &[u8]) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[0] = seven[0] & 0xfe;
        for i in 1..7 {
            key[i] = (seven[i - 1] << (8 - i)) | (seven[i] >> i);
        }
        key[7] = seven[6] << 1;
        key
    }

    /// `ChallengeResponse`: three DES encryptions of the challenge under
    /// the zero-padded password hash
    pub fn challenge_response(challenge: &[u8; 8], password_hash: &[u8; 16]) -> [u8; 24] {
        let mut z_hash = [0u8; 21];
        z_hash[..16].copy_from_slice(password_hash);
        let mut response = [0u8; 24];
        for i in 0..3 {
            let des = Des::new(&des_key(&z_hash[i * 7..i * 7 + 7]).into());
            let mut block = GenericArray::clone_from_slice(challenge);
            des.encrypt_block(&mut block);
            response[i * 8..i * 8 + 8].copy_from_slice(&block);
        }
        response
    }

    /// `GenerateNTResponse`
    pub fn nt_response(
        authenticator_challenge: &[u8; 16],
        peer_challenge: &[u8; 16],
        username: &str,
        password: &str,
    ) -> [u8; 24] {
        let challenge = challenge_hash(peer_challenge, authenticator_challenge, username);
        challenge_response(&challenge, &nt_password_hash(password))
    }

    /// `GenerateAuthenticatorResponse`: the `S=<40 hex>` proof the
    /// server sends back on success
    pub fn authenticator_response(
        password: &str,
        nt_response: &[u8],
        peer_challenge: &[u8; 16],
        authenticator_challenge: &[u8; 16],
        username: &str,
    ) -> String {
        let hash_hash: [u8; 16] = {
            let mut md4 = Md4::new();
            md4.update(nt_password_hash(password));
            md4.finalize().into()
        };
        let mut sha = Sha1::new();
        sha.update(hash_hash);
        sha.update(nt_response);
        sha.update(MAGIC1);
        let digest = sha.finalize();

        let challenge = challenge_hash(peer_challenge, authenticator_challenge, username);
        let mut sha = Sha1::new();
        sha.update(digest);
        sha.update(challenge);
        sha.update(MAGIC2);
        let proof = sha.finalize();

        let mut out = String::with_capacity(2 + 40);
        out.push_str("S=");
        for byte in proof {
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }

    /// The 64-octet MSK both IKE sides derive their final AUTH from:
    /// master send key, master receive key, 32 octets of zero
    pub fn msk(password: &str, nt_response: &[u8]) -> [u8; 64] {
        let hash_hash: [u8; 16] = {
            let mut md4 = Md4::new();
            md4.update(nt_password_hash(password));
            md4.finalize().into()
        };
        let mut sha = Sha1::new();
        sha.update(hash_hash);
        sha.update(nt_response);
        sha.update(MPPE_MASTER);
        let master = sha.finalize();

        let start_key = |magic: &[u8]| -> [u8; 16] {
            let mut sha = Sha1::new();
            sha.update(&master[..16]);
            sha.update(SHS_PAD1);
            sha.update(magic);
            sha.update(SHS_PAD2);
            let digest = sha.finalize();
            let mut key = [0u8; 16];
            key.copy_from_slice(&digest[..16]);
            key
        };

        let mut msk = [0u8; 64];
        msk[..16].copy_from_slice(&start_key(MPPE_SEND));
        msk[16..32].copy_from_slice(&start_key(MPPE_RECV));
        msk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the worked example of RFC 2759, section 9.2
    const USER: &str = "User";
    const PASSWORD: &str = "clientPass";
    const AUTH_CHALLENGE: [u8; 16] = [
        0x5b, 0x5d, 0x7c, 0x7d, 0x7b, 0x3f, 0x2f, 0x3e, 0x3c, 0x2c, 0x60, 0x21, 0x32, 0x26, 0x26,
        0x28,
    ];
    const PEER_CHALLENGE: [u8; 16] = [
        0x21, 0x40, 0x23, 0x24, 0x25, 0x5e, 0x26, 0x2a, 0x28, 0x29, 0x5f, 0x2b, 0x3a, 0x33, 0x7c,
        0x7e,
    ];
    const NT_RESPONSE: [u8; 24] = [
        0x82, 0x30, 0x9e, 0xcd, 0x8d, 0x70, 0x8b, 0x5e, 0xa0, 0x8f, 0xaa, 0x39, 0x81, 0xcd, 0x83,
        0x54, 0x42, 0x33, 0x11, 0x4a, 0x3d, 0x85, 0xd6, 0xdf,
    ];

    #[test]
    fn challenge_hash_vector() {
        assert_eq!(
            mschap::challenge_hash(&PEER_CHALLENGE, &AUTH_CHALLENGE, USER),
            [0xd0, 0x2e, 0x43, 0x86, 0xbc, 0xe9, 0x12, 0x26]
        );
    }

    #[test]
    fn nt_password_hash_vector() {
        assert_eq!(
            mschap::nt_password_hash(PASSWORD),
            [
                0x44, 0xeb, 0xba, 0x8d, 0x53, 0x12, 0xb8, 0xd6, 0x11, 0x47, 0x44, 0x11, 0xf5,
                0x69, 0x89, 0xae
            ]
        );
    }

    #[test]
    fn nt_response_vector() {
        assert_eq!(
            mschap::nt_response(&AUTH_CHALLENGE, &PEER_CHALLENGE, USER, PASSWORD),
            NT_RESPONSE
        );
    }

    #[test]
    fn authenticator_response_vector() {
        assert_eq!(
            mschap::authenticator_response(
                PASSWORD,
                &NT_RESPONSE,
                &PEER_CHALLENGE,
                &AUTH_CHALLENGE,
                USER
            ),
            "S=407A5589115FD0D6209F510FE9C04566932CDA56"
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn full_conversation_succeeds() {
        let users = vec![crate::policy::EapUser {
            name: "alice".into(),
            password: "hunter2".into(),
        }];
        let (mut state, identity_request) = EapState::start();
        assert_eq!(identity_request.eap_type, Some(EAP_TYPE_IDENTITY));

        // peer answers with its identity
        let step = state
            .handle(
                &users,
                &EapMessage {
                    code: EapCode::Response,
                    identifier: identity_request.identifier,
                    eap_type: Some(EAP_TYPE_IDENTITY),
                    data: b"alice".to_vec(),
                },
            )
            .unwrap();
        let EapStep::Reply(challenge_request) = step else {
            panic!("expected a challenge request");
        };

        // dig the authenticator challenge out of the request and build a
        // proper client response
        let auth_challenge: [u8; 16] = challenge_request.data[5..21].try_into().unwrap();
        let peer_challenge = [0x55u8; 16];
        let nt = mschap::nt_response(&auth_challenge, &peer_challenge, "alice", "hunter2");
        let mut value = vec![49u8];
        value.extend_from_slice(&peer_challenge);
        value.extend_from_slice(&[0; 8]);
        value.extend_from_slice(&nt);
        value.push(0);
        let mut data = vec![2u8, challenge_request.identifier];
        data.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        data.extend(value);

        let step = state
            .handle(
                &users,
                &EapMessage {
                    code: EapCode::Response,
                    identifier: challenge_request.identifier,
                    eap_type: Some(EAP_TYPE_MSCHAPV2),
                    data,
                },
            )
            .unwrap();
        let EapStep::Reply(success_request) = step else {
            panic!("expected the success request");
        };
        assert!(success_request.data[4..].starts_with(b"S="));

        // peer acknowledges, conversation completes with an MSK
        let step = state
            .handle(
                &users,
                &EapMessage {
                    code: EapCode::Response,
                    identifier: success_request.identifier,
                    eap_type: Some(EAP_TYPE_MSCHAPV2),
                    data: vec![3],
                },
            )
            .unwrap();
        assert!(matches!(step, EapStep::Success(_)));
        assert_eq!(state.msk().unwrap().len(), 64);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn wrong_password_fails() {
        let users = vec![crate::policy::EapUser {
            name: "alice".into(),
            password: "correct".into(),
        }];
        let (mut state, identity_request) = EapState::start();
        let EapStep::Reply(challenge_request) = state
            .handle(
                &users,
                &EapMessage {
                    code: EapCode::Response,
                    identifier: identity_request.identifier,
                    eap_type: Some(EAP_TYPE_IDENTITY),
                    data: b"alice".to_vec(),
                },
            )
            .unwrap()
        else {
            panic!("expected a challenge request");
        };

        let auth_challenge: [u8; 16] = challenge_request.data[5..21].try_into().unwrap();
        let nt = mschap::nt_response(&auth_challenge, &[0x66; 16], "alice", "wrong");
        let mut value = vec![49u8];
        value.extend_from_slice(&[0x66; 16]);
        value.extend_from_slice(&[0; 8]);
        value.extend_from_slice(&nt);
        value.push(0);
        let mut data = vec![2u8, challenge_request.identifier];
        data.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        data.extend(value);

        let step = state
            .handle(
                &users,
                &EapMessage {
                    code: EapCode::Response,
                    identifier: challenge_request.identifier,
                    eap_type: Some(EAP_TYPE_MSCHAPV2),
                    data,
                },
            )
            .unwrap();
        assert!(matches!(step, EapStep::Failure(_)));
    }
}
