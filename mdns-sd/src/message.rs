//! Message assembler: packs questions/answers/authorities/additionals into
//! ≤MTU datagrams and parses inbound datagrams back into the same shape.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::name::{self, CompressionTable};
use crate::records::{Class, RData, Record, RecordType, Srv, Txt, TypeBitmap};

pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1440;
pub const MIN_MAX_DATAGRAM_SIZE: usize = 512;

const HEADER_LEN: usize = 12;

pub const FLAG_RESPONSE: u16 = 0x8000;
pub const FLAG_AUTHORITATIVE: u16 = 0x0400;
pub const FLAG_TRUNCATED: u16 = 0x0200;

/// The 12-byte DNS message header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }
    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AUTHORITATIVE != 0
    }
    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TRUNCATED != 0
    }
    pub fn opcode(&self) -> u8 {
        ((self.flags >> 11) & 0xF) as u8
    }
    pub fn rcode(&self) -> u8 {
        (self.flags & 0xF) as u8
    }
}

/// {name, type, class, unicast-response-wanted bit}. The
/// unicast-response-wanted bit is carried in `class.flush_or_unicast`,
/// reusing the same top-bit-of-class slot the record codec uses for
/// cache-flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
    pub class: Class,
}

impl Question {
    pub fn new(name: impl Into<String>, rtype: RecordType, unicast_response_wanted: bool) -> Self {
        Self {
            name: name.into(),
            rtype,
            class: Class::new(Class::IN, unicast_response_wanted),
        }
    }

    pub fn unicast_response_wanted(&self) -> bool {
        self.class.flush_or_unicast
    }
}

/// A fully parsed inbound message, minus the inbound-source tag, which
/// the reactor attaches separately since it knows which socket the
/// datagram arrived on.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

fn parse_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedMessage("header truncated"));
    }
    Ok(Header {
        id: u16::from_be_bytes([buf[0], buf[1]]),
        flags: u16::from_be_bytes([buf[2], buf[3]]),
        qd_count: u16::from_be_bytes([buf[4], buf[5]]),
        an_count: u16::from_be_bytes([buf[6], buf[7]]),
        ns_count: u16::from_be_bytes([buf[8], buf[9]]),
        ar_count: u16::from_be_bytes([buf[10], buf[11]]),
    })
}

/// Parse a complete inbound datagram: header, then count-prefixed
/// questions/answers/authorities/additionals. Unknown record types decode
/// as opaque `RData::Raw` rather than failing the whole message.
pub fn decode(buf: &[u8]) -> Result<Message> {
    let header = parse_header(buf)?;
    let mut offset = HEADER_LEN;

    let mut questions = Vec::with_capacity(header.qd_count as usize);
    for _ in 0..header.qd_count {
        let (name, new_offset) = name::decode(buf, offset)?;
        offset = new_offset;
        if offset + 4 > buf.len() {
            return Err(Error::MalformedMessage("question truncated"));
        }
        let rtype = RecordType::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
        let class = Class::from_u16(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
        offset += 4;
        questions.push(Question { name, rtype, class });
    }

    let sections = [
        (header.an_count as usize, 0u8),
        (header.ns_count as usize, 1u8),
        (header.ar_count as usize, 2u8),
    ];

    let mut answers = Vec::new();
    let mut authorities = Vec::new();
    let mut additionals = Vec::new();

    for (count, which) in sections {
        for _ in 0..count {
            let (name, new_offset) = name::decode(buf, offset)?;
            offset = new_offset;
            if offset + 10 > buf.len() {
                return Err(Error::MalformedMessage("record truncated"));
            }
            let rtype_raw = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let rtype = RecordType::from_u16(rtype_raw);
            let class = Class::from_u16(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
            let ttl = u32::from_be_bytes([buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7]]);
            let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
            offset += 10;
            if offset + rdlength > buf.len() {
                return Err(Error::MalformedMessage("rdata truncated"));
            }

            let rdata = decode_rdata(buf, offset, rdlength, rtype).map_err(|_| Error::MalformedRecord {
                name: name.clone(),
                rtype: rtype_raw,
                reason: "invalid rdata",
            })?;
            offset += rdlength;

            let record = Record {
                name,
                rtype,
                class,
                ttl,
                created_at_ms: 0,
                rdata,
            };

            match which {
                0 => answers.push(record),
                1 => authorities.push(record),
                _ => additionals.push(record),
            }
        }
    }

    Ok(Message {
        header,
        questions,
        answers,
        authorities,
        additionals,
    })
}

fn decode_rdata(buf: &[u8], offset: usize, rdlength: usize, rtype: RecordType) -> Result<RData> {
    let end = offset + rdlength;
    match rtype {
        RecordType::A => {
            if rdlength != 4 {
                return Ok(RData::Raw(buf[offset..end].to_vec()));
            }
            Ok(RData::A(Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])))
        }
        RecordType::AAAA => {
            if rdlength != 16 {
                return Ok(RData::Raw(buf[offset..end].to_vec()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..end]);
            Ok(RData::Aaaa(Ipv6Addr::from(octets)))
        }
        RecordType::PTR => {
            let (target, _) = name::decode(buf, offset)?;
            Ok(RData::Ptr(target))
        }
        RecordType::SRV => {
            if rdlength < 6 {
                return Ok(RData::Raw(buf[offset..end].to_vec()));
            }
            let priority = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let weight = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
            let port = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
            let (target, _) = name::decode(buf, offset + 6)?;
            Ok(RData::Srv(Srv { priority, weight, port, target }))
        }
        RecordType::TXT => Ok(RData::Txt(Txt(buf[offset..end].to_vec()))),
        RecordType::NSEC => {
            let (next_name, name_end) = name::decode(buf, offset)?;
            // The bitmap immediately follows the name's on-the-wire bytes at
            // this offset, not wherever a compression pointer jumped to.
            let bitmap_start = name_end.min(end);
            let types = TypeBitmap::decode(&buf[bitmap_start..end]);
            Ok(RData::Nsec { next_name, types })
        }
        _ => Ok(RData::Raw(buf[offset..end].to_vec())),
    }
}

fn encode_rdata(rdata: &RData, table: &mut CompressionTable, buf: &mut Vec<u8>) -> Result<()> {
    let len_pos = buf.len();
    buf.extend_from_slice(&[0, 0]);
    let start = buf.len();

    match rdata {
        RData::A(addr) => buf.extend_from_slice(&addr.octets()),
        RData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
        RData::Ptr(target) => table.encode(target, buf)?,
        RData::Srv(srv) => {
            buf.extend_from_slice(&srv.priority.to_be_bytes());
            buf.extend_from_slice(&srv.weight.to_be_bytes());
            buf.extend_from_slice(&srv.port.to_be_bytes());
            table.encode(&srv.target, buf)?;
        }
        RData::Txt(txt) => buf.extend_from_slice(&txt.0),
        RData::Nsec { next_name, types } => {
            table.encode(next_name, buf)?;
            types.encode(buf);
        }
        RData::Raw(bytes) => buf.extend_from_slice(bytes),
    }

    let rdlength = buf.len() - start;
    if rdlength > u16::MAX as usize {
        return Err(Error::MalformedMessage("rdata exceeds 65535 bytes"));
    }
    buf[len_pos..start].copy_from_slice(&(rdlength as u16).to_be_bytes());
    Ok(())
}

fn encode_record(record: &Record, table: &mut CompressionTable, buf: &mut Vec<u8>) -> Result<()> {
    table.encode(&record.name, buf)?;
    buf.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
    buf.extend_from_slice(&record.class.to_u16().to_be_bytes());
    buf.extend_from_slice(&record.ttl.to_be_bytes());
    encode_rdata(&record.rdata, table, buf)
}

fn patch_header(buf: &mut [u8], id: u16, flags: u16, qd: u16, an: u16, ns: u16, ar: u16) {
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    buf[2..4].copy_from_slice(&flags.to_be_bytes());
    buf[4..6].copy_from_slice(&qd.to_be_bytes());
    buf[6..8].copy_from_slice(&an.to_be_bytes());
    buf[8..10].copy_from_slice(&ns.to_be_bytes());
    buf[10..12].copy_from_slice(&ar.to_be_bytes());
}

/// Assemble one or more outbound datagrams from a question set and up to
/// three record sections. Questions are written into the first datagram
/// only and are never split (an encode failure if they alone exceed
/// `max_size`); answers/authorities/additionals are appended one record at
/// a time, spilling into a fresh datagram — with its own compression
/// table — whenever the next record would not fit.
/// Continuation datagrams set the truncated flag when more records remain
/// after them, carry zero questions, and begin counting their own
/// an/ns/ar sections from zero.
pub fn encode(
    id: u16,
    flags: u16,
    questions: &[Question],
    answers: &[Record],
    authorities: &[Record],
    additionals: &[Record],
    max_size: usize,
) -> Result<Vec<Vec<u8>>> {
    let max_size = max_size.max(MIN_MAX_DATAGRAM_SIZE);
    let mut datagrams = Vec::new();

    let mut buf = vec![0u8; HEADER_LEN];
    let mut table = CompressionTable::new();
    for q in questions {
        table.encode(&q.name, &mut buf)?;
        buf.extend_from_slice(&q.rtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&q.class.to_u16().to_be_bytes());
    }
    if buf.len() > max_size {
        return Err(Error::MalformedMessage("questions exceed datagram size limit"));
    }

    let mut an_count = 0u16;
    let mut ns_count = 0u16;
    let mut ar_count = 0u16;
    let mut qd_count = questions.len() as u16;

    let all_sections: [(&[Record], u8); 3] = [(answers, 0), (authorities, 1), (additionals, 2)];
    let total_records: usize = answers.len() + authorities.len() + additionals.len();
    let mut written = 0usize;

    for (records, which) in all_sections {
        for record in records {
            let mut trial_table = table.clone();
            let mut trial_buf = Vec::new();
            encode_record(record, &mut trial_table, &mut trial_buf)?;

            if buf.len() + trial_buf.len() > max_size && buf.len() > HEADER_LEN {
                let more_remaining = written < total_records;
                let datagram_flags = if more_remaining { flags | FLAG_TRUNCATED } else { flags };
                patch_header(&mut buf, id, datagram_flags, qd_count, an_count, ns_count, ar_count);
                datagrams.push(std::mem::take(&mut buf));

                buf = vec![0u8; HEADER_LEN];
                table = CompressionTable::new();
                qd_count = 0;
                an_count = 0;
                ns_count = 0;
                ar_count = 0;

                trial_table = table.clone();
                trial_buf.clear();
                encode_record(record, &mut trial_table, &mut trial_buf)?;
            }

            buf.extend_from_slice(&trial_buf);
            table = trial_table;
            match which {
                0 => an_count += 1,
                1 => ns_count += 1,
                _ => ar_count += 1,
            }
            written += 1;
        }
    }

    patch_header(&mut buf, id, flags, qd_count, an_count, ns_count, ar_count);
    datagrams.push(buf);

    Ok(datagrams)
}
