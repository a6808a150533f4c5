//! InnoDB on-disk format handling and the tablespace import pipeline.
//!
//! The leaves of the dependency tree parse and mutate the binary page
//! format ([`constants`], [`page_types`], [`page`], [`checksum`],
//! [`record`]); [`codec`] turns physical page images into logical ones and
//! back; [`tablespace`] and [`iterator`] stream a `.ibd` file through
//! per-page visitors; [`metadata`] and [`schema`] handle the exported
//! schema snapshot and its match against the live definition; and
//! [`converter`], [`purge`], [`instant`] and [`import`] implement the
//! import passes themselves.
//!
//! Start with [`import::import_tablespace`].

pub mod catalog;
pub mod checksum;
pub mod codec;
pub mod constants;
pub mod converter;
pub mod import;
pub mod instant;
pub mod iterator;
pub mod metadata;
pub mod page;
pub mod page_types;
pub mod purge;
pub mod record;
pub mod schema;
pub mod tablespace;

#[cfg(test)]
pub(crate) mod test_pages;
