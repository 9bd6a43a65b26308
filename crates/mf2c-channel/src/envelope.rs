// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message envelope: framing, signing and encryption.
//!
//! On the wire every message is `base64(JSON(fields))`. Binary values
//! (`signature`, and the `payload` of PRIVATE messages) are themselves base64
//! inside the JSON so they survive the string encoding intact.
//!
//! # Security levels
//!
//! | Level     | `payload`           | `signature` / `publicKey` |
//! |-----------|---------------------|---------------------------|
//! | PUBLIC    | plaintext           | absent                    |
//! | PROTECTED | plaintext           | over plaintext            |
//! | PRIVATE   | base64(ciphertext)  | over plaintext            |
//!
//! Inbound PRIVATE envelopes keep the ciphertext in `payload` and expose the
//! recovered text under `decryptedPayload`.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::RsaPublicKey;
use serde_json::{Map, Value};

use crate::error::MessageError;
use crate::flags::{Protocol, QoS, Security};
use crate::identity::{self, Identity};

/// String-keyed field map carried by every envelope.
pub type Fields = Map<String, Value>;

/// Field names used on the wire.
pub mod field {
    pub const SOURCE: &str = "source";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SECURITY: &str = "security";
    pub const PROTOCOL: &str = "protocol";
    pub const QOS: &str = "qos";
    pub const PAYLOAD: &str = "payload";
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const SIGNATURE: &str = "signature";
    pub const PING_REQUEST_TS: &str = "pingRequestTS";
    pub const DECRYPTED_PAYLOAD: &str = "decryptedPayload";
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encode fields as `base64(JSON)`.
pub fn encode_fields(fields: &Fields) -> Result<String, MessageError> {
    let json = serde_json::to_vec(fields).map_err(|e| MessageError::Malformed(e.to_string()))?;
    Ok(BASE64.encode(json))
}

/// Decode `base64(JSON)` into fields. The JSON must be an object.
pub fn decode_fields(raw: &[u8]) -> Result<Fields, MessageError> {
    let json = BASE64
        .decode(raw)
        .map_err(|e| MessageError::Malformed(format!("base64: {}", e)))?;
    match serde_json::from_slice(&json) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(MessageError::Malformed("envelope is not a JSON object".into())),
        Err(e) => Err(MessageError::Malformed(format!("JSON: {}", e))),
    }
}

/// Whether an envelope was built locally or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One message plus its framing metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    direction: Direction,
    raw: Option<String>,
    fields: Fields,
    dest_key: Option<RsaPublicKey>,
    received_tmsp: Option<u64>,
}

impl Envelope {
    /// Outbound envelope around application fields.
    pub fn outbound(fields: Fields) -> Self {
        Self {
            direction: Direction::Outbound,
            raw: None,
            fields,
            dest_key: None,
            received_tmsp: None,
        }
    }

    /// Outbound envelope with only a `payload` field.
    pub fn with_payload(payload: impl Into<String>) -> Self {
        let mut fields = Fields::new();
        fields.insert(field::PAYLOAD.into(), Value::String(payload.into()));
        Self::outbound(fields)
    }

    /// Inbound envelope around raw wire bytes. Call [`unpack`](Self::unpack)
    /// to populate the fields.
    pub fn inbound(raw: impl Into<String>) -> Self {
        Self {
            direction: Direction::Inbound,
            raw: Some(raw.into()),
            fields: Fields::new(),
            dest_key: None,
            received_tmsp: Some(epoch_secs()),
        }
    }

    /// Inbound envelope from a wire payload. Non-UTF-8 bytes are kept lossily
    /// and rejected by `unpack` as malformed base64.
    pub fn from_wire(bytes: &[u8]) -> Self {
        Self::inbound(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Set the remote key used to encrypt an outbound PRIVATE payload.
    pub fn set_dest_key(&mut self, key: RsaPublicKey) {
        self.dest_key = Some(key);
    }

    /// Pack with the process identity.
    pub fn pack(
        &mut self,
        security: Security,
        protocol: Protocol,
        qos: QoS,
        recipient: Option<&RsaPublicKey>,
    ) -> Result<(), MessageError> {
        let identity = Identity::get_instance()?;
        self.pack_with(identity, security, protocol, qos, recipient)
    }

    /// Stamp flags, sign, encrypt, and produce the raw wire form.
    ///
    /// `recipient` takes precedence over a key set with
    /// [`set_dest_key`](Self::set_dest_key).
    pub fn pack_with(
        &mut self,
        identity: &Identity,
        security: Security,
        protocol: Protocol,
        qos: QoS,
        recipient: Option<&RsaPublicKey>,
    ) -> Result<(), MessageError> {
        if self.direction != Direction::Outbound {
            return Err(MessageError::BadDirection("pack called on an inbound envelope"));
        }
        if self.fields.is_empty() {
            return Err(MessageError::Empty);
        }

        // Everything fallible runs on a copy; a failed pack leaves the
        // envelope untouched.
        let mut fields = self.fields.clone();
        fields.insert(field::SECURITY.into(), Value::from(security.ordinal()));
        fields.insert(field::PROTOCOL.into(), Value::from(protocol.ordinal()));
        fields.insert(field::QOS.into(), Value::from(qos.ordinal()));

        if security != Security::Public {
            let payload = match fields.get(field::PAYLOAD) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) if s.is_empty() => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    return Err(MessageError::Malformed(format!(
                        "{} payload must be a string",
                        security
                    )))
                }
            };
            match payload {
                Some(payload) => self.seal(identity, security, recipient, &payload, &mut fields)?,
                None => tracing::warn!(
                    "Packing a {} envelope without payload, nothing to sign",
                    security
                ),
            }
        }

        let raw = encode_fields(&fields)?;
        self.fields = fields;
        self.raw = Some(raw);
        Ok(())
    }

    /// Sign `payload` into `fields` and, for PRIVATE, replace it with the
    /// ciphertext.
    fn seal(
        &self,
        identity: &Identity,
        security: Security,
        recipient: Option<&RsaPublicKey>,
        payload: &str,
        fields: &mut Fields,
    ) -> Result<(), MessageError> {
        let key = match security {
            Security::Private => Some(
                recipient
                    .or(self.dest_key.as_ref())
                    .ok_or(MessageError::NoRecipientKey)?,
            ),
            _ => None,
        };

        let signature = identity
            .sign_as_string(payload.as_bytes())
            .map_err(|e| MessageError::SignFailed(e.to_string()))?;
        fields.insert(
            field::PUBLIC_KEY.into(),
            Value::String(identity.public_key_pem().to_string()),
        );
        fields.insert(field::SIGNATURE.into(), Value::String(signature));

        if let Some(key) = key {
            let ciphertext = identity::encrypt_for(key, payload.as_bytes())
                .map_err(|e| MessageError::Crypto(e.to_string()))?;
            fields.insert(field::PAYLOAD.into(), Value::String(BASE64.encode(ciphertext)));
        }
        Ok(())
    }

    /// Unpack with the process identity.
    pub fn unpack(&mut self) -> Result<(), MessageError> {
        let identity = Identity::get_instance()?;
        self.unpack_with(identity)
    }

    /// Decode the raw form, then verify and decrypt according to `security`.
    ///
    /// PRIVATE payloads are decrypted first; the signature is checked against
    /// the recovered plaintext.
    pub fn unpack_with(&mut self, identity: &Identity) -> Result<(), MessageError> {
        if self.direction != Direction::Inbound {
            return Err(MessageError::BadDirection("unpack called on an outbound envelope"));
        }
        let raw = self.raw.as_deref().ok_or(MessageError::Empty)?;
        let mut fields = decode_fields(raw.as_bytes())?;

        let security = read_ordinal(&fields, field::SECURITY)?
            .ok_or_else(|| MessageError::Malformed("missing security field".into()))
            .and_then(|n| {
                Security::from_ordinal(n)
                    .ok_or_else(|| MessageError::Malformed(format!("unknown security ordinal {}", n)))
            })?;
        if let Some(n) = read_ordinal(&fields, field::QOS)? {
            QoS::from_ordinal(n)
                .ok_or_else(|| MessageError::Malformed(format!("unknown qos ordinal {}", n)))?;
        }
        if let Some(n) = read_ordinal(&fields, field::PROTOCOL)? {
            Protocol::from_ordinal(n)
                .ok_or_else(|| MessageError::Malformed(format!("unknown protocol ordinal {}", n)))?;
        }

        if security == Security::Public {
            self.fields = fields;
            return Ok(());
        }

        let signature = required_str(&fields, field::SIGNATURE)?;
        let public_key = required_str(&fields, field::PUBLIC_KEY)?;
        let payload = required_str(&fields, field::PAYLOAD)?;

        let sender_key = identity::parse_public_key(public_key)
            .map_err(|e| MessageError::Malformed(e.to_string()))?;

        let plaintext = if security == Security::Private {
            let ciphertext = BASE64
                .decode(payload)
                .map_err(|e| MessageError::Malformed(format!("ciphertext base64: {}", e)))?;
            let clear = identity
                .decrypt(&ciphertext)
                .map_err(|e| MessageError::Crypto(e.to_string()))?;
            Some(
                String::from_utf8(clear)
                    .map_err(|_| MessageError::Malformed("decrypted payload is not UTF-8".into()))?,
            )
        } else {
            None
        };

        let signed = plaintext.as_deref().unwrap_or(payload);
        let signature = BASE64
            .decode(signature)
            .map_err(|_| MessageError::BadSignature)?;
        if !identity::verify(&sender_key, signed.as_bytes(), &signature) {
            return Err(MessageError::BadSignature);
        }

        if let Some(text) = plaintext {
            fields.insert(field::DECRYPTED_PAYLOAD.into(), Value::String(text));
        }
        self.fields = fields;
        self.dest_key = Some(sender_key);
        Ok(())
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Wire form: set on inbound construction, produced by `pack` on outbound.
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// Remote key: the sender's key after unpack, or the encryption key.
    pub fn dest_key(&self) -> Option<&RsaPublicKey> {
        self.dest_key.as_ref()
    }

    /// Local receipt time (epoch seconds) of an inbound envelope.
    pub fn received_tmsp(&self) -> Option<u64> {
        self.received_tmsp
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn payload(&self) -> Option<&str> {
        self.get_str(field::PAYLOAD)
    }

    pub fn decrypted_payload(&self) -> Option<&str> {
        self.get_str(field::DECRYPTED_PAYLOAD)
    }

    pub fn source(&self) -> Option<&str> {
        self.get_str(field::SOURCE)
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.get_u64(field::TIMESTAMP)
    }

    pub fn security(&self) -> Option<Security> {
        self.get_u64(field::SECURITY).and_then(Security::from_ordinal)
    }

    pub fn qos(&self) -> Option<QoS> {
        self.get_u64(field::QOS).and_then(QoS::from_ordinal)
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.get_u64(field::PROTOCOL).and_then(Protocol::from_ordinal)
    }
}

fn read_ordinal(fields: &Fields, key: &str) -> Result<Option<u64>, MessageError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| MessageError::Malformed(format!("{} is not an ordinal", key))),
    }
}

fn required_str<'a>(fields: &'a Fields, key: &'static str) -> Result<&'a str, MessageError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| MessageError::Malformed(format!("missing {}", key)))
}
