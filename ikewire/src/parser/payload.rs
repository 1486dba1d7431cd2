use zerocopy::FromBytes;

use crate::defs::header::{
    AuthHeader, DeleteHeader, EapHeader, FragmentHeader, IdHeader, KeyExchangeHeader,
};
use crate::defs::params::{
    AuthMethod, CertificateEncoding, EapCode, IdType, KeyExchangeMethod, PayloadType,
    SecurityProtocol,
};
use crate::defs::{
    Authentication, Certificate, CertificateRequest, Delete, EapMessage, EncryptedPayload,
    Fragment, Identity, KeyExchange, Payload, SecurityAssociation,
};
use crate::parser::{PayloadResult, ParserError};

impl Payload {
    /// Parse a single payload body (without its generic header).
    ///
    /// `next_raw` is the raw next-payload octet of the payload's generic
    /// header; it is only consumed by the encrypted payload variants,
    /// where it names the first payload hidden inside the ciphertext.
    pub(crate) fn try_parse(
        current: PayloadType,
        next_raw: u8,
        body: &[u8],
    ) -> PayloadResult<Payload> {
        Ok(match current {
            PayloadType::SecurityAssociation => Some(Payload::SecurityAssociation(
                SecurityAssociation::try_parse(body)?,
            )),
            PayloadType::KeyExchange => {
                let header =
                    KeyExchangeHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
                Some(Payload::KeyExchange(KeyExchange {
                    group: KeyExchangeMethod::try_from(header.dh_group_num.get())?,
                    data: body[size_of::<KeyExchangeHeader>()..].to_vec(),
                }))
            }
            PayloadType::IdentificationInitiator => {
                Some(Payload::IdInitiator(parse_identity(body)?))
            }
            PayloadType::IdentificationResponder => {
                Some(Payload::IdResponder(parse_identity(body)?))
            }
            PayloadType::Certificate => {
                let (encoding, data) = split_cert_encoding(body)?;
                Some(Payload::Certificate(Certificate { encoding, data }))
            }
            PayloadType::CertificateRequest => {
                let (encoding, hashes) = split_cert_encoding(body)?;
                Some(Payload::CertificateRequest(CertificateRequest {
                    encoding,
                    hashes,
                }))
            }
            PayloadType::Authentication => {
                let header = AuthHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
                Some(Payload::Authentication(Authentication {
                    method: AuthMethod::try_from(header.auth_method)?,
                    data: body[size_of::<AuthHeader>()..].to_vec(),
                }))
            }
            PayloadType::Nonce => Some(Payload::Nonce(body.to_vec())),
            PayloadType::Notify => super::notify::parse_notify(body)?.map(Payload::Notify),
            PayloadType::Delete => Some(Payload::Delete(parse_delete(body)?)),
            PayloadType::VendorID => Some(Payload::VendorId(body.to_vec())),
            PayloadType::TrafficSelectorInitiator => {
                Some(Payload::TsInitiator(super::ts::parse_selectors(body)?))
            }
            PayloadType::TrafficSelectorResponder => {
                Some(Payload::TsResponder(super::ts::parse_selectors(body)?))
            }
            PayloadType::EncryptedAndAuthenticated => Some(Payload::Encrypted(EncryptedPayload {
                next_payload: next_raw,
                data: body.to_vec(),
            })),
            PayloadType::Configuration => {
                Some(Payload::Configuration(super::conf::parse_configuration(body)?))
            }
            PayloadType::ExtensibleAuthentication => Some(Payload::Eap(parse_eap(body)?)),
            PayloadType::EncryptedAndAuthenticatedFragment => {
                let header =
                    FragmentHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
                Some(Payload::EncryptedFragment(Fragment {
                    fragment_number: header.fragment_number.get(),
                    total_fragments: header.total_fragments.get(),
                    next_payload: next_raw,
                    data: body[size_of::<FragmentHeader>()..].to_vec(),
                }))
            }
            // Understood by the chain walker but carrying no data model here
            PayloadType::NoNextPayload
            | PayloadType::GenericSecurePasswordMethod
            | PayloadType::PuzzleSolution => None,
        })
    }
}

fn parse_identity(body: &[u8]) -> Result<Identity, ParserError> {
    let header = IdHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
    Ok(Identity {
        id_type: IdType::try_from(header.id_type)?,
        data: body[size_of::<IdHeader>()..].to_vec(),
    })
}

fn split_cert_encoding(body: &[u8]) -> Result<(CertificateEncoding, Vec<u8>), ParserError> {
    let (&encoding, rest) = body.split_first().ok_or(ParserError::BufferTooSmall)?;
    Ok((CertificateEncoding::try_from(encoding)?, rest.to_vec()))
}

fn parse_delete(body: &[u8]) -> Result<Delete, ParserError> {
    let header = DeleteHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
    let spi_size = header.spi_size as usize;
    let count = header.num_spis.get() as usize;
    let data = &body[size_of::<DeleteHeader>()..];
    let spis = if spi_size == 0 {
        vec![]
    } else {
        if spi_size.checked_mul(count).ok_or(ParserError::PayloadOverrun)? > data.len() {
            return Err(ParserError::SubstructureMismatch);
        }
        data.chunks_exact(spi_size)
            .take(count)
            .map(<[u8]>::to_vec)
            .collect()
    };
    Ok(Delete {
        protocol: SecurityProtocol::try_from(header.protocol_id)?,
        spis,
    })
}

fn parse_eap(body: &[u8]) -> Result<EapMessage, ParserError> {
    let header = EapHeader::ref_from_prefix(body).ok_or(ParserError::BufferTooSmall)?;
    let length = header.length.get() as usize;
    if length < size_of::<EapHeader>() || length > body.len() {
        return Err(ParserError::SubstructureMismatch);
    }
    let code = EapCode::try_from(header.code)?;
    let rest = &body[size_of::<EapHeader>()..length];
    let (eap_type, data) = match code {
        EapCode::Request | EapCode::Response => {
            let (&t, d) = rest.split_first().ok_or(ParserError::BufferTooSmall)?;
            (Some(t), d.to_vec())
        }
        EapCode::Success | EapCode::Failure => (None, vec![]),
    };
    Ok(EapMessage {
        code,
        identifier: header.identifier,
        eap_type,
        data,
    })
}
