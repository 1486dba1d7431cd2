use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::defs::header::{
    AuthHeader, DeleteHeader, EapHeader, FragmentHeader, GenericPayloadHeader, IdHeader,
    KeyExchangeHeader,
};
use crate::defs::params::{EapCode, PayloadType};
use crate::defs::Payload;
use crate::generator::GeneratorError;

impl Payload {
    pub(crate) fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        if let Payload::Nonce(v) = self {
            if v.len() < 16 || v.len() > 256 {
                return Err(GeneratorError::InvalidNonceLength);
            }
        }
        let body = match self {
            Payload::SecurityAssociation(v) => v.try_build()?,
            Payload::KeyExchange(v) => {
                let header = KeyExchangeHeader {
                    dh_group_num: U16::from(v.group as u16),
                    reserved: U16::ZERO,
                };
                let mut body = Vec::with_capacity(size_of::<KeyExchangeHeader>() + v.data.len());
                body.extend_from_slice(header.as_bytes());
                body.extend_from_slice(&v.data);
                body
            }
            Payload::IdInitiator(v) | Payload::IdResponder(v) => {
                let header = IdHeader {
                    id_type: v.id_type as u8,
                    reserved: [0; 3],
                };
                let mut body = Vec::with_capacity(size_of::<IdHeader>() + v.data.len());
                body.extend_from_slice(header.as_bytes());
                body.extend_from_slice(&v.data);
                body
            }
            Payload::Certificate(v) => {
                let mut body = Vec::with_capacity(1 + v.data.len());
                body.push(v.encoding as u8);
                body.extend_from_slice(&v.data);
                body
            }
            Payload::CertificateRequest(v) => {
                let mut body = Vec::with_capacity(1 + v.hashes.len());
                body.push(v.encoding as u8);
                body.extend_from_slice(&v.hashes);
                body
            }
            Payload::Authentication(v) => {
                let header = AuthHeader {
                    auth_method: v.method as u8,
                    reserved: [0; 3],
                };
                let mut body = Vec::with_capacity(size_of::<AuthHeader>() + v.data.len());
                body.extend_from_slice(header.as_bytes());
                body.extend_from_slice(&v.data);
                body
            }
            Payload::Notify(v) => v.build(),
            Payload::Delete(v) => {
                let spi_size = v.spis.first().map(Vec::len).unwrap_or(0);
                if spi_size > 255 {
                    return Err(GeneratorError::SpiTooLarge);
                }
                let header = DeleteHeader {
                    protocol_id: v.protocol as u8,
                    spi_size: spi_size as u8,
                    num_spis: U16::from(v.spis.len() as u16),
                };
                let mut body =
                    Vec::with_capacity(size_of::<DeleteHeader>() + spi_size * v.spis.len());
                body.extend_from_slice(header.as_bytes());
                for spi in &v.spis {
                    body.extend_from_slice(spi);
                }
                body
            }
            Payload::Nonce(v) | Payload::VendorId(v) => v.clone(),
            Payload::TsInitiator(v) | Payload::TsResponder(v) => v.build(),
            Payload::Encrypted(v) => v.data.clone(),
            Payload::Configuration(v) => v.build(),
            Payload::Eap(v) => {
                let length = size_of::<EapHeader>()
                    + match v.code {
                        EapCode::Request | EapCode::Response => 1 + v.data.len(),
                        EapCode::Success | EapCode::Failure => 0,
                    };
                let header = EapHeader {
                    code: v.code as u8,
                    identifier: v.identifier,
                    length: U16::from(length as u16),
                };
                let mut body = Vec::with_capacity(length);
                body.extend_from_slice(header.as_bytes());
                if let Some(eap_type) = v.eap_type {
                    body.push(eap_type);
                    body.extend_from_slice(&v.data);
                }
                body
            }
            Payload::EncryptedFragment(v) => {
                let header = FragmentHeader {
                    fragment_number: U16::from(v.fragment_number),
                    total_fragments: U16::from(v.total_fragments),
                };
                let mut body = Vec::with_capacity(size_of::<FragmentHeader>() + v.data.len());
                body.extend_from_slice(header.as_bytes());
                body.extend_from_slice(&v.data);
                body
            }
        };
        self.build_generic(next_payload, &body)
    }

    fn build_generic(
        &self,
        next_payload: PayloadType,
        data: &[u8],
    ) -> Result<Vec<u8>, GeneratorError> {
        let length = size_of::<GenericPayloadHeader>() + data.len();
        if u16::try_from(length).is_err() {
            return Err(GeneratorError::PayloadTooLarge);
        }
        let header = GenericPayloadHeader {
            next_payload: self.wire_next_payload(next_payload),
            critical: 0,
            payload_length: U16::from(length as u16),
        };
        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(data);
        Ok(packet)
    }
}
