//! Stream ciphers for the relay wire.
//!
//! Every connection owns one [`Encryptor`] holding independent cumulative
//! state per direction. Methods that carry an IV emit it as a one-time
//! prefix on the first output of the encrypting direction and consume it
//! from the front of the first input on the decrypting direction; a partial
//! IV is buffered and `decrypt` returns empty until it is complete.

use std::io;
use std::str::FromStr;

use md5::{Digest, Md5};

/// Cipher methods understood by [`Encryptor::new`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    /// Identity transform. Useful for tests and debugging only.
    Plain,
    /// Password-derived byte substitution table.
    Table,
    /// RC4 keyed per direction with MD5(key ‖ IV), 16-byte IV.
    Rc4Md5,
}

impl FromStr for Method {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<Method> {
        match s {
            "plain" => Ok(Method::Plain),
            "table" => Ok(Method::Table),
            "rc4-md5" => Ok(Method::Rc4Md5),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown cipher method: {}", s),
            )),
        }
    }
}

fn md5sum(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt: the digest chain
/// `D1 = MD5(password), D2 = MD5(D1 ‖ password), …` concatenated and
/// truncated to `key_len`.
fn derive_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 15);
    let mut digest: Option<[u8; 16]> = None;
    while key.len() < key_len {
        let mut input = Vec::new();
        if let Some(prev) = digest {
            input.extend_from_slice(&prev);
        }
        input.extend_from_slice(password);
        let d = md5sum(&input);
        key.extend_from_slice(&d);
        digest = Some(d);
    }
    key.truncate(key_len);
    key
}

/// RC4 keystream state.
struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Rc4 {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Rc4 { s, i: 0, j: 0 }
    }

    fn process(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            out.push(byte ^ k);
        }
    }
}

const IV_LEN: usize = 16;

/// Builds the substitution table: 256 entries repeatedly stable-sorted by
/// `a % (x + i)` where `a` is the low half of MD5(password), little-endian.
fn substitution_table(password: &[u8]) -> ([u8; 256], [u8; 256]) {
    let digest = md5sum(password);
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    let a = u64::from_le_bytes(low);
    let mut table: Vec<u8> = (0u8..=255).collect();
    for i in 1..1024u64 {
        table.sort_by_key(|&x| a % (x as u64 + i));
    }
    let mut encrypt = [0u8; 256];
    let mut decrypt = [0u8; 256];
    for (i, &v) in table.iter().enumerate() {
        encrypt[i] = v;
        decrypt[v as usize] = i as u8;
    }
    (encrypt, decrypt)
}

enum Cipher {
    Plain,
    Table {
        encrypt: [u8; 256],
        decrypt: [u8; 256],
    },
    Rc4Md5 {
        key: Vec<u8>,
        encrypt: Option<Rc4>,
        decrypt: Option<Rc4>,
        // Bytes of a not-yet-complete decrypt-side IV.
        pending_iv: Vec<u8>,
    },
}

/// Stateful bidirectional stream cipher owned by one connection.
///
/// `encrypt` and `decrypt` keep independent cumulative state, so one
/// `Encryptor` simultaneously seals one direction and opens the other.
pub struct Encryptor {
    cipher: Cipher,
}

impl Encryptor {
    pub fn new(password: &str, method: Method) -> Encryptor {
        let cipher = match method {
            Method::Plain => Cipher::Plain,
            Method::Table => {
                let (encrypt, decrypt) = substitution_table(password.as_bytes());
                Cipher::Table { encrypt, decrypt }
            }
            Method::Rc4Md5 => Cipher::Rc4Md5 {
                key: derive_key(password.as_bytes(), IV_LEN),
                encrypt: None,
                decrypt: None,
                pending_iv: Vec::new(),
            },
        };
        Encryptor { cipher }
    }

    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        match &mut self.cipher {
            Cipher::Plain => data.to_vec(),
            Cipher::Table { encrypt, .. } => data.iter().map(|&b| encrypt[b as usize]).collect(),
            Cipher::Rc4Md5 { key, encrypt, .. } => {
                let mut out = Vec::with_capacity(data.len() + IV_LEN);
                if encrypt.is_none() {
                    let iv: [u8; IV_LEN] = rand::random();
                    out.extend_from_slice(&iv);
                    *encrypt = Some(Rc4::new(&session_key(key, &iv)));
                }
                if let Some(rc4) = encrypt {
                    rc4.process(data, &mut out);
                }
                out
            }
        }
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        match &mut self.cipher {
            Cipher::Plain => data.to_vec(),
            Cipher::Table { decrypt, .. } => data.iter().map(|&b| decrypt[b as usize]).collect(),
            Cipher::Rc4Md5 {
                key,
                decrypt,
                pending_iv,
                ..
            } => {
                let mut data = data;
                if decrypt.is_none() {
                    let missing = IV_LEN - pending_iv.len();
                    if data.len() < missing {
                        pending_iv.extend_from_slice(data);
                        return Vec::new();
                    }
                    pending_iv.extend_from_slice(&data[..missing]);
                    data = &data[missing..];
                    *decrypt = Some(Rc4::new(&session_key(key, pending_iv)));
                }
                let mut out = Vec::with_capacity(data.len());
                if let Some(rc4) = decrypt {
                    rc4.process(data, &mut out);
                }
                out
            }
        }
    }
}

fn session_key(key: &[u8], iv: &[u8]) -> [u8; 16] {
    let mut input = Vec::with_capacity(key.len() + iv.len());
    input.extend_from_slice(key);
    input.extend_from_slice(iv);
    md5sum(&input)
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let method = match self.cipher {
            Cipher::Plain => "plain",
            Cipher::Table { .. } => "table",
            Cipher::Rc4Md5 { .. } => "rc4-md5",
        };
        f.debug_struct("Encryptor").field("method", &method).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_from_str() {
        assert_eq!("plain".parse::<Method>().unwrap(), Method::Plain);
        assert_eq!("table".parse::<Method>().unwrap(), Method::Table);
        assert_eq!("rc4-md5".parse::<Method>().unwrap(), Method::Rc4Md5);
        assert!("aes-256-cfb".parse::<Method>().is_err());
    }

    #[test]
    fn derive_key_single_block_is_md5() {
        // For key_len <= 16 EVP_BytesToKey degenerates to MD5(password).
        let key = derive_key(b"foobar", 16);
        assert_eq!(
            key,
            [
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43,
                0x12, 0xc6, 0x3f
            ]
        );
    }

    #[test]
    fn derive_key_chains_digests() {
        let key = derive_key(b"secret", 32);
        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], &md5sum(b"secret"));
        let mut second = Vec::new();
        second.extend_from_slice(&md5sum(b"secret"));
        second.extend_from_slice(b"secret");
        assert_eq!(&key[16..], &md5sum(&second));
    }

    #[test]
    fn table_is_permutation() {
        let (encrypt, decrypt) = substitution_table(b"barfoo!");
        let mut seen = [false; 256];
        for &v in encrypt.iter() {
            assert!(!seen[v as usize]);
            seen[v as usize] = true;
        }
        for i in 0..=255u8 {
            assert_eq!(decrypt[encrypt[i as usize] as usize], i);
        }
    }

    #[test]
    fn table_round_trip_across_instances() {
        let mut sealing = Encryptor::new("pass-phrase", Method::Table);
        let mut opening = Encryptor::new("pass-phrase", Method::Table);
        let plaintext = b"the quick brown fox";
        let wire = sealing.encrypt(plaintext);
        assert_ne!(&wire[..], &plaintext[..]);
        assert_eq!(opening.decrypt(&wire), plaintext);
    }

    #[test]
    fn rc4_md5_round_trip() {
        let mut sealing = Encryptor::new("pass-phrase", Method::Rc4Md5);
        let mut opening = Encryptor::new("pass-phrase", Method::Rc4Md5);

        let first = sealing.encrypt(b"hello");
        // IV prefix on the first record only.
        assert_eq!(first.len(), IV_LEN + 5);
        assert_eq!(opening.decrypt(&first), b"hello");

        let second = sealing.encrypt(b", world");
        assert_eq!(second.len(), 7);
        assert_eq!(opening.decrypt(&second), b", world");
    }

    #[test]
    fn rc4_md5_partial_iv_returns_empty() {
        let mut sealing = Encryptor::new("pass-phrase", Method::Rc4Md5);
        let mut opening = Encryptor::new("pass-phrase", Method::Rc4Md5);
        let wire = sealing.encrypt(b"split delivery");

        let mut plain = Vec::new();
        for (i, chunk) in wire.chunks(1).enumerate() {
            let out = opening.decrypt(chunk);
            if i < IV_LEN {
                // Nothing may come out before the IV is complete.
                assert!(out.is_empty());
            }
            plain.extend_from_slice(&out);
        }
        assert_eq!(plain, b"split delivery");
    }

    #[test]
    fn directions_are_independent() {
        let mut left = Encryptor::new("pw", Method::Rc4Md5);
        let mut right = Encryptor::new("pw", Method::Rc4Md5);

        let up = left.encrypt(b"upstream");
        let down = right.encrypt(b"downstream");
        assert_eq!(right.decrypt(&up), b"upstream");
        assert_eq!(left.decrypt(&down), b"downstream");
    }
}
