//! # Author I/O
//!
//! Packing turns a stream of content into stored documents: the printer
//! reads fixed-size chunks, encrypts each into a page, and stores it; the
//! resulting entry inlines a single page or references many by key, and
//! carries the AES-GCM-encrypted metadata. Unpacking reverses the process,
//! streaming pages back out in index order and verifying the whole-content
//! MAC against the metadata.

use std::io::{Read, Write};

use tracing::debug;

use crate::documents::{Document, Entry, EntryContents, Envelope, Metadata, Page};
use crate::enc::{
    decrypt_metadata, decrypt_page, encrypt_metadata, encrypt_page, EekKeys, EncError,
    RunningMac,
};
use crate::id::Id;
use crate::peer::unix_seconds;
use crate::storage::{DocumentStore, StorageError};

/// Default page size: 64 KiB of plaintext per page.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Packing parameters.
#[derive(Debug, Clone)]
pub struct PackParams {
    pub page_size: usize,
}

impl Default for PackParams {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Packing and unpacking failures.
#[derive(Debug)]
pub enum PackError {
    Io(std::io::Error),
    Storage(StorageError),
    Enc(EncError),
    /// The given key did not resolve to an entry document.
    NotAnEntry,
    /// A referenced page document is absent or not a page.
    MissingPage(Id),
    /// Pages arrived out of index order.
    PageOutOfOrder { expected: u32, actual: u32 },
    /// The reassembled ciphertext does not match the metadata MAC.
    ContentMacMismatch,
}

impl std::fmt::Display for PackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackError::Io(e) => write!(f, "content IO failed: {}", e),
            PackError::Storage(e) => write!(f, "document storage failed: {}", e),
            PackError::Enc(e) => write!(f, "encryption failed: {}", e),
            PackError::NotAnEntry => write!(f, "document is not an entry"),
            PackError::MissingPage(id) => write!(f, "missing page document {}", id),
            PackError::PageOutOfOrder { expected, actual } => {
                write!(f, "page index {} where {} expected", actual, expected)
            }
            PackError::ContentMacMismatch => write!(f, "content MAC mismatch"),
        }
    }
}

impl std::error::Error for PackError {}

impl From<std::io::Error> for PackError {
    fn from(e: std::io::Error) -> Self {
        PackError::Io(e)
    }
}

impl From<StorageError> for PackError {
    fn from(e: StorageError) -> Self {
        PackError::Storage(e)
    }
}

impl From<EncError> for PackError {
    fn from(e: EncError) -> Self {
        PackError::Enc(e)
    }
}

/// Packs content into entries and unpacks entries back into content.
pub struct Packer {
    params: PackParams,
    docs: DocumentStore,
}

impl Packer {
    pub fn new(params: PackParams, docs: DocumentStore) -> Self {
        Self { params, docs }
    }

    /// Print, encrypt, and store the content as pages under one entry.
    /// Returns the entry key and the plaintext metadata.
    pub fn pack(
        &self,
        content: &mut dyn Read,
        media_type: &str,
        keys: &EekKeys,
        author_public_key: &[u8],
    ) -> Result<(Id, Metadata), PackError> {
        let mut page_keys = Vec::new();
        let mut content_mac = RunningMac::new(keys);
        let mut uncompressed_size = 0u64;
        let mut ciphertext_size = 0u64;
        let mut buf = vec![0u8; self.params.page_size];
        let mut index = 0u32;

        loop {
            let n = read_full(content, &mut buf)?;
            if n == 0 && index > 0 {
                break;
            }

            let (ciphertext, ciphertext_mac) = encrypt_page(keys, index, &buf[..n]);
            content_mac.update(&ciphertext);
            uncompressed_size += n as u64;
            ciphertext_size += ciphertext.len() as u64;

            let page = Page {
                author_public_key: author_public_key.to_vec(),
                index,
                ciphertext,
                ciphertext_mac,
            };
            let key = self.docs.store_document(&Document::Page(page))?;
            page_keys.push(key);
            index += 1;

            if n < self.params.page_size {
                break;
            }
        }

        let metadata = Metadata {
            media_type: media_type.to_string(),
            ciphertext_size,
            uncompressed_size,
            ciphertext_mac: content_mac.finalize(),
        };
        let (metadata_ciphertext, metadata_ciphertext_mac) = encrypt_metadata(keys, &metadata)?;

        let contents = if page_keys.len() == 1 {
            match self.docs.load_document(&page_keys[0])? {
                Some(Document::Page(page)) => EntryContents::Page(page),
                _ => return Err(PackError::MissingPage(page_keys[0])),
            }
        } else {
            EntryContents::PageKeys(page_keys)
        };

        let entry = Entry {
            author_public_key: author_public_key.to_vec(),
            contents,
            created_time: unix_seconds(),
            metadata_ciphertext,
            metadata_ciphertext_mac,
        };
        let entry_key = self.docs.store_document(&Document::Entry(entry))?;
        debug!(
            entry_key = %entry_key,
            pages = index,
            uncompressed_size,
            "packed entry"
        );
        Ok((entry_key, metadata))
    }

    /// Stream the entry's pages back to `out` in index order, verifying
    /// MACs along the way. Returns the decrypted metadata.
    pub fn unpack(
        &self,
        entry_key: &Id,
        keys: &EekKeys,
        out: &mut dyn Write,
    ) -> Result<Metadata, PackError> {
        let entry = match self.docs.load_document(entry_key)? {
            Some(Document::Entry(entry)) => entry,
            Some(_) | None => return Err(PackError::NotAnEntry),
        };
        let metadata = decrypt_metadata(
            keys,
            &entry.metadata_ciphertext,
            &entry.metadata_ciphertext_mac,
        )?;

        let mut content_mac = RunningMac::new(keys);
        match &entry.contents {
            EntryContents::Page(page) => {
                self.scan_page(page, 0, keys, &mut content_mac, out)?;
            }
            EntryContents::PageKeys(page_keys) => {
                for (position, key) in page_keys.iter().enumerate() {
                    let page = match self.docs.load_document(key)? {
                        Some(Document::Page(page)) => page,
                        Some(_) | None => return Err(PackError::MissingPage(*key)),
                    };
                    self.scan_page(&page, position as u32, keys, &mut content_mac, out)?;
                }
            }
        }

        if content_mac.finalize() != metadata.ciphertext_mac {
            return Err(PackError::ContentMacMismatch);
        }
        Ok(metadata)
    }

    fn scan_page(
        &self,
        page: &Page,
        expected_index: u32,
        keys: &EekKeys,
        content_mac: &mut RunningMac,
        out: &mut dyn Write,
    ) -> Result<(), PackError> {
        if page.index != expected_index {
            return Err(PackError::PageOutOfOrder {
                expected: expected_index,
                actual: page.index,
            });
        }
        let plaintext = decrypt_page(keys, page.index, &page.ciphertext, &page.ciphertext_mac)?;
        content_mac.update(&page.ciphertext);
        out.write_all(&plaintext)?;
        Ok(())
    }

    /// Build and store the envelope addressing `entry_key` to a reader.
    pub fn envelope(
        &self,
        entry_key: Id,
        author_public_key: &[u8],
        reader_public_key: &[u8],
    ) -> Result<Id, PackError> {
        let envelope = Document::Envelope(Envelope {
            entry_key,
            author_public_key: author_public_key.to_vec(),
            reader_public_key: reader_public_key.to_vec(),
        });
        Ok(self.docs.store_document(&envelope)?)
    }
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
