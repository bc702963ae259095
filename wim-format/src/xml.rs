//! The XML data resource describing each image.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};
use crate::ImageSelector;

const UTF16LE_BOM: [u8; 2] = [0xff, 0xfe];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub description: String,
    pub dir_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub hard_link_bytes: u64,
    pub creation_time: u64,
    pub last_modification_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WimInfo {
    pub images: Vec<ImageInfo>,
}

fn xml_err(e: impl std::fmt::Display) -> Error {
    Error::invalid_data(format!("XML data: {}", e))
}

fn write_text<W: std::io::Write>(writer: &mut Writer<W>, tag: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

fn write_time<W: std::io::Write>(writer: &mut Writer<W>, tag: &str, filetime: u64) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    write_text(writer, "HIGHPART", &format!("0x{:08X}", filetime >> 32))?;
    write_text(writer, "LOWPART", &format!("0x{:08X}", filetime & 0xffff_ffff))?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

fn parse_hex(text: &str) -> Result<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(xml_err)
}

fn parse_dec(text: &str) -> Result<u64> {
    text.trim().parse().map_err(xml_err)
}

impl WimInfo {
    pub fn image(&self, index: u32) -> Option<&ImageInfo> {
        let i = usize::try_from(index).ok()?.checked_sub(1)?;
        self.images.get(i)
    }

    pub fn image_mut(&mut self, index: u32) -> Option<&mut ImageInfo> {
        let i = usize::try_from(index).ok()?.checked_sub(1)?;
        self.images.get_mut(i)
    }

    /// Serializes the selected image(s) as UTF-16LE with a byte order mark.
    ///
    /// A single selected image is renumbered to index 1. `total_bytes` is the
    /// WIM-level `TOTALBYTES`, the offset the XML data is written at.
    pub fn to_bytes(&self, image: ImageSelector, total_bytes: u64) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Start(BytesStart::new("WIM")))
            .map_err(xml_err)?;
        write_text(&mut writer, "TOTALBYTES", &total_bytes.to_string())?;

        let selected: Vec<(u32, &ImageInfo)> = match image {
            ImageSelector::All => (1u32..).zip(self.images.iter()).collect(),
            ImageSelector::Index(i) => {
                let info = self.image(i).ok_or(Error::InvalidImage(i))?;
                vec![(1, info)]
            }
        };

        for (index, info) in selected {
            let index = index.to_string();
            let mut start = BytesStart::new("IMAGE");
            start.push_attribute(("INDEX", index.as_str()));
            writer.write_event(Event::Start(start)).map_err(xml_err)?;
            write_text(&mut writer, "DIRCOUNT", &info.dir_count.to_string())?;
            write_text(&mut writer, "FILECOUNT", &info.file_count.to_string())?;
            write_text(&mut writer, "TOTALBYTES", &info.total_bytes.to_string())?;
            write_text(&mut writer, "HARDLINKBYTES", &info.hard_link_bytes.to_string())?;
            write_time(&mut writer, "CREATIONTIME", info.creation_time)?;
            write_time(&mut writer, "LASTMODIFICATIONTIME", info.last_modification_time)?;
            if !info.name.is_empty() {
                write_text(&mut writer, "NAME", &info.name)?;
            }
            if !info.description.is_empty() {
                write_text(&mut writer, "DESCRIPTION", &info.description)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("IMAGE")))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("WIM")))
            .map_err(xml_err)?;

        let utf8 = writer.into_inner().into_inner();
        let text = String::from_utf8(utf8).map_err(xml_err)?;
        let mut out = UTF16LE_BOM.to_vec();
        out.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<WimInfo> {
        let body = buf.strip_prefix(&UTF16LE_BOM[..]).unwrap_or(buf);
        if body.len() % 2 != 0 {
            return Err(xml_err("odd UTF-16 length"));
        }
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let text = String::from_utf16(&units).map_err(xml_err)?;
        WimInfo::parse(&text)
    }

    fn parse(text: &str) -> Result<WimInfo> {
        // Text is kept verbatim: names and descriptions may start or end
        // with whitespace.
        let mut reader = Reader::from_str(text);

        let mut images: Vec<(u32, ImageInfo)> = vec![];
        let mut stack: Vec<String> = vec![];
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_uppercase();
                    if name == "IMAGE" && stack.len() == 1 {
                        let index = match e.try_get_attribute("INDEX").map_err(xml_err)? {
                            Some(attr) => {
                                let value = attr.unescape_value().map_err(xml_err)?;
                                parse_dec(&value)? as u32
                            }
                            None => images.len() as u32 + 1,
                        };
                        images.push((index, ImageInfo::default()));
                    }
                    stack.push(name);
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(t) => {
                    let value = t.unescape().map_err(xml_err)?;
                    let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                    if let Some((_, info)) = images.last_mut() {
                        apply_image_field(info, &path, &value)?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        images.sort_by_key(|(index, _)| *index);
        for (expected, (index, _)) in (1u32..).zip(images.iter()) {
            if *index != expected {
                return Err(xml_err(format!("image index {} out of sequence", index)));
            }
        }
        Ok(WimInfo {
            images: images.into_iter().map(|(_, info)| info).collect(),
        })
    }
}

fn apply_image_field(info: &mut ImageInfo, path: &[&str], value: &str) -> Result<()> {
    match path {
        ["WIM", "IMAGE", "NAME"] => info.name = value.to_string(),
        ["WIM", "IMAGE", "DESCRIPTION"] => info.description = value.to_string(),
        ["WIM", "IMAGE", "DIRCOUNT"] => info.dir_count = parse_dec(value)?,
        ["WIM", "IMAGE", "FILECOUNT"] => info.file_count = parse_dec(value)?,
        ["WIM", "IMAGE", "TOTALBYTES"] => info.total_bytes = parse_dec(value)?,
        ["WIM", "IMAGE", "HARDLINKBYTES"] => info.hard_link_bytes = parse_dec(value)?,
        ["WIM", "IMAGE", "CREATIONTIME", part] => {
            set_time_part(&mut info.creation_time, part, value)?
        }
        ["WIM", "IMAGE", "LASTMODIFICATIONTIME", part] => {
            set_time_part(&mut info.last_modification_time, part, value)?
        }
        _ => {}
    }
    Ok(())
}

fn set_time_part(time: &mut u64, part: &str, value: &str) -> Result<()> {
    let v = parse_hex(value)? & 0xffff_ffff;
    match part {
        "HIGHPART" => *time = (*time & 0xffff_ffff) | (v << 32),
        "LOWPART" => *time = (*time & !0xffff_ffff) | v,
        _ => {}
    }
    Ok(())
}
