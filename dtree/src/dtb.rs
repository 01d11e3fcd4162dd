//! Flattened device tree (`.dtb`/`.itb`) reader.

use nom::{
    bytes::complete::{tag, take, take_until},
    multi::many_till,
    number::complete::{be_u32, be_u64},
    sequence::{terminated, tuple},
    Finish,
};
use tracing::debug;

use crate::{
    tree::{Document, DocumentBuilder, NodeId},
    Error,
};

pub const MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Oldest layout with an inline strings block and no in-structure paths.
const MIN_VERSION: u32 = 16;

type IResult<'a, T> = nom::IResult<&'a [u8], T>;

#[derive(Debug, Clone, Copy)]
struct Header {
    totalsize: u32,
    off_dt_struct: u32,
    off_dt_strings: u32,
    off_mem_rsvmap: u32,
    version: u32,
    size_dt_strings: u32,
    size_dt_struct: u32,
}

/// Check whether `data` starts with the flattened device tree magic.
pub fn is_dtb(data: &[u8]) -> bool {
    data.get(..4) == Some(&MAGIC.to_be_bytes()[..])
}

/// Decode a flattened device tree blob.
pub fn parse(data: &[u8]) -> Result<Document, Error> {
    let (_, header) = header(data)
        .finish()
        .map_err(|_| Error::Dtb("truncated header".into()))?;
    debug!(?header, "read fdt header");

    if header.version < MIN_VERSION {
        return Err(Error::Dtb(format!(
            "unsupported version {}, need at least {MIN_VERSION}",
            header.version
        )));
    }
    if header.totalsize as usize > data.len() {
        return Err(Error::Dtb(format!(
            "header claims {} bytes but only {} are present",
            header.totalsize,
            data.len()
        )));
    }

    let block = |off: u32, size: Option<u32>, what: &str| {
        let start = off as usize;
        let end = size.map_or(header.totalsize as usize, |s| start.saturating_add(s as usize));
        data.get(start..end)
            .ok_or_else(|| Error::Dtb(format!("{what} block is out of bounds")))
    };
    let rsvmap = block(header.off_mem_rsvmap, None, "memory reservation")?;
    let structs = block(header.off_dt_struct, Some(header.size_dt_struct), "structure")?;
    let strings = block(header.off_dt_strings, Some(header.size_dt_strings), "strings")?;

    let mut builder = DocumentBuilder::new();

    let (_, (entries, _)) = many_till(
        tuple((be_u64, be_u64)),
        tag(&[0u8; 16][..]),
    )(rsvmap)
    .finish()
    .map_err(|_: nom::error::Error<&[u8]>| Error::Dtb("unterminated memory reservation block".into()))?;
    for (address, size) in entries {
        builder.add_memreserve(address, size);
    }

    read_structure(structs, strings, &mut builder)?;
    Ok(builder.build())
}

fn header(input: &[u8]) -> IResult<Header> {
    let (input, _) = tag(&MAGIC.to_be_bytes()[..])(input)?;
    let (input, (totalsize, off_dt_struct, off_dt_strings, off_mem_rsvmap, version)) =
        tuple((be_u32, be_u32, be_u32, be_u32, be_u32))(input)?;
    let (input, (_last_comp_version, _boot_cpuid_phys, size_dt_strings, size_dt_struct)) =
        tuple((be_u32, be_u32, be_u32, be_u32))(input)?;

    Ok((
        input,
        Header {
            totalsize,
            off_dt_struct,
            off_dt_strings,
            off_mem_rsvmap,
            version,
            size_dt_strings,
            size_dt_struct,
        },
    ))
}

/// Parse a NUL-terminated string.
fn cstr(input: &[u8]) -> IResult<&[u8]> {
    terminated(take_until(&b"\0"[..]), tag(&b"\0"[..]))(input)
}

fn padding(consumed: usize) -> usize {
    (4 - consumed % 4) % 4
}

fn utf8(bytes: &[u8], what: &str) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Dtb(format!("{what} is not valid UTF-8")))
}

/// Walk the structure block token by token.
fn read_structure(
    mut input: &[u8],
    strings: &[u8],
    builder: &mut DocumentBuilder,
) -> Result<(), Error> {
    let truncated = |_: nom::error::Error<&[u8]>| Error::Dtb("truncated structure block".into());
    let mut stack: Vec<NodeId> = Vec::new();
    let mut seen_root = false;

    loop {
        let (rest, token) = be_u32(input).finish().map_err(truncated)?;
        input = rest;

        match token {
            FDT_BEGIN_NODE => {
                let (rest, name) = cstr(input).finish().map_err(truncated)?;
                let (rest, _) = take(padding(name.len() + 1))(rest)
                    .finish()
                    .map_err(truncated)?;
                input = rest;

                let name = utf8(name, "node name")?;
                let id = match stack.last() {
                    None if !seen_root => {
                        seen_root = true;
                        builder.root()
                    }
                    None => return Err(Error::Dtb("more than one root node".into())),
                    Some(&parent) => builder.add_node(parent, name),
                };
                stack.push(id);
            }
            FDT_END_NODE => {
                stack
                    .pop()
                    .ok_or_else(|| Error::Dtb("unbalanced end of node".into()))?;
            }
            FDT_PROP => {
                let node = *stack
                    .last()
                    .ok_or_else(|| Error::Dtb("property outside of a node".into()))?;
                let (rest, (len, nameoff)) =
                    tuple((be_u32, be_u32))(input).finish().map_err(truncated)?;
                let (rest, value) = take(len)(rest).finish().map_err(truncated)?;
                let (rest, _) = take(padding(len as usize))(rest)
                    .finish()
                    .map_err(truncated)?;
                input = rest;

                let name = strings
                    .get(nameoff as usize..)
                    .and_then(|s| cstr(s).ok())
                    .map(|(_, name)| name)
                    .ok_or_else(|| Error::Dtb(format!("bad property name offset {nameoff}")))?;
                builder.add_property(node, utf8(name, "property name")?, value.to_vec());
            }
            FDT_NOP => {}
            FDT_END if stack.is_empty() && seen_root => return Ok(()),
            FDT_END => return Err(Error::Dtb("end of structure inside a node".into())),
            other => return Err(Error::Dtb(format!("unknown token {other:#x}"))),
        }
    }
}
