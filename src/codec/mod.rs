//! Wire codec: message bodies ([`message`]) wrapped by hand-rolled envelope
//! framing ([`envelope`]) — label header, CRC, gzip compression, AES-GCM
//! encryption, and compound packing. See spec §4.2.

pub mod envelope;
pub mod message;

pub use envelope::{
    decode_compound, decode_packet, encode_compound, encode_packet, prepend_label, strip_label,
    DecodedCompound, EncodeOptions,
};
pub use message::{decode_message, encode_message, MessageType};
