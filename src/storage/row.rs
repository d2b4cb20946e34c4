//! The fixed-shape record stored in leaf cells.
//!
//! A row is a 32-bit id plus two zero-padded text slots. The serialized
//! layout is the wire format: offsets here must match the leaf cell layout
//! in [`super::node`] bit for bit.

use crate::errors::Error;
use std::fmt;

/// Size of the id field (4 bytes, equivalent to uint32_t).
pub const ID_SIZE: usize = std::mem::size_of::<u32>();

/// Capacity of the username slot in bytes.
pub const USERNAME_MAX: usize = 32;

/// Capacity of the email slot in bytes.
pub const EMAIL_MAX: usize = 255;

const ID_OFFSET: usize = 0;
const USERNAME_OFFSET: usize = ID_OFFSET + ID_SIZE;
const EMAIL_OFFSET: usize = USERNAME_OFFSET + USERNAME_MAX;

/// Serialized size of a row inside a leaf cell.
pub const ROW_SIZE: usize = ID_SIZE + USERNAME_MAX + EMAIL_MAX;

/// One record: `id` is the unique key, the text fields are zero-padded
/// byte strings. Shorter values carry their trailing null bytes
/// implicitly in the fixed slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: u32,
    username: [u8; USERNAME_MAX],
    email: [u8; EMAIL_MAX],
}

impl Row {
    /// Builds a row, rejecting text that does not fit its slot.
    pub fn new(id: u32, username: &str, email: &str) -> Result<Self, Error> {
        Ok(Row {
            id,
            username: str_to_fixed_bytes("username", username)?,
            email: str_to_fixed_bytes("email", email)?,
        })
    }

    pub fn username(&self) -> String {
        fixed_bytes_to_string(&self.username)
    }

    pub fn email(&self) -> String {
        fixed_bytes_to_string(&self.email)
    }

    /// Writes the row into a `ROW_SIZE` destination slice.
    pub fn serialize(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() != ROW_SIZE {
            return Err(err!(
                Corrupt,
                "row destination is {} bytes, expected {}",
                dest.len(),
                ROW_SIZE
            ));
        }
        dest[ID_OFFSET..ID_OFFSET + ID_SIZE].copy_from_slice(&self.id.to_le_bytes());
        dest[USERNAME_OFFSET..USERNAME_OFFSET + USERNAME_MAX].copy_from_slice(&self.username);
        dest[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_MAX].copy_from_slice(&self.email);
        Ok(())
    }

    /// Reads a row back from a `ROW_SIZE` source slice.
    pub fn deserialize(src: &[u8]) -> Result<Self, Error> {
        if src.len() != ROW_SIZE {
            return Err(err!(
                Corrupt,
                "row source is {} bytes, expected {}",
                src.len(),
                ROW_SIZE
            ));
        }
        let mut id_bytes = [0u8; ID_SIZE];
        id_bytes.copy_from_slice(&src[ID_OFFSET..ID_OFFSET + ID_SIZE]);
        let mut username = [0u8; USERNAME_MAX];
        username.copy_from_slice(&src[USERNAME_OFFSET..USERNAME_OFFSET + USERNAME_MAX]);
        let mut email = [0u8; EMAIL_MAX];
        email.copy_from_slice(&src[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_MAX]);
        Ok(Row {
            id: u32::from_le_bytes(id_bytes),
            username,
            email,
        })
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.id, self.username(), self.email())
    }
}

fn str_to_fixed_bytes<const N: usize>(
    field: &'static str,
    input: &str,
) -> Result<[u8; N], Error> {
    let bytes = input.as_bytes();
    if bytes.len() > N {
        return Err(Error::StringTooLong {
            field,
            len: bytes.len(),
            max: N,
        });
    }
    let mut buffer = [0u8; N];
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(buffer)
}

fn fixed_bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let row = Row::new(7, "alice", "a@example.com").unwrap();
        let mut buf = [0u8; ROW_SIZE];
        row.serialize(&mut buf).unwrap();
        let back = Row::deserialize(&buf).unwrap();
        assert_eq!(back, row);
        assert_eq!(back.username(), "alice");
        assert_eq!(back.email(), "a@example.com");
    }

    #[test]
    fn accepts_exact_bounds() {
        let name = "n".repeat(USERNAME_MAX);
        let email = "e".repeat(EMAIL_MAX);
        let row = Row::new(1, &name, &email).unwrap();
        assert_eq!(row.username(), name);
        assert_eq!(row.email(), email);
    }

    #[test]
    fn rejects_one_past_bounds() {
        let name = "n".repeat(USERNAME_MAX + 1);
        match Row::new(1, &name, "e") {
            Err(Error::StringTooLong { field, len, max }) => {
                assert_eq!(field, "username");
                assert_eq!(len, USERNAME_MAX + 1);
                assert_eq!(max, USERNAME_MAX);
            }
            other => panic!("expected StringTooLong, got {:?}", other),
        }
        let email = "e".repeat(EMAIL_MAX + 1);
        assert!(matches!(
            Row::new(1, "n", &email),
            Err(Error::StringTooLong { field: "email", .. })
        ));
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let row = Row::new(1, "n", "e").unwrap();
        let mut short = [0u8; ROW_SIZE - 1];
        assert!(row.serialize(&mut short).is_err());
        assert!(Row::deserialize(&short).is_err());
    }
}
