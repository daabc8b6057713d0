use log::{debug, warn};
use quick_xml::events::{attributes::AttrError, BytesStart, Event};
use quick_xml::{Error as QuickXmlError, Reader};
use std::collections::BTreeMap;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

/// Namespace URI qualifying Android platform attributes (`android:*`).
pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

const TYPE_NULL: u8 = 0x00;
const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_FLOAT: u8 = 0x04;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> BinaryXmlResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(BinaryXmlError::MalformedDocument(
                "Unexpected end of binary XML".to_string(),
            ));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> BinaryXmlResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(BinaryXmlError::MalformedDocument(
                "Unexpected end of binary XML".to_string(),
            ));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> BinaryXmlResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(BinaryXmlError::MalformedDocument(
                "Unexpected end of binary XML".to_string(),
            ));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return Err(BinaryXmlError::MalformedDocument(
                "Attempted to seek past end of document".to_string(),
            ));
        }
        self.pos = offset;
        Ok(())
    }
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> BinaryXmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let styles_start = reader.read_u32()? as usize;

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }

        for _ in 0..style_count {
            reader.read_u32()?; // skip style offsets
        }

        let strings_base = header.start + strings_start;
        let chunk_end = header.end();

        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }

        if styles_start != 0 {
            // Skip style data entirely by seeking to chunk end.
            reader.seek(chunk_end)?;
        }

        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug)]
struct NamespaceFrame {
    prefix: Option<String>,
    uri: Option<String>,
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(BinaryXmlError::MalformedDocument(
            "String offset exceeds chunk bounds".to_string(),
        ));
    }
    let (char_len, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(BinaryXmlError::MalformedDocument(
            "UTF-8 string exceeds chunk bounds".to_string(),
        ));
    }
    let slice = &data[cursor..cursor + byte_len];
    let text = std::str::from_utf8(slice)
        .map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))?;
    cursor += byte_len;
    if cursor >= limit {
        return Err(BinaryXmlError::MalformedDocument(
            "Missing UTF-8 terminator".to_string(),
        ));
    }
    // `char_len` is unused but parsed for completeness.
    let _ = char_len;
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(BinaryXmlError::MalformedDocument(
            "UTF-16 string exceeds chunk bounds".to_string(),
        ));
    }
    let mut units = Vec::with_capacity(char_count);
    for chunk in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    cursor += byte_len;
    if cursor + 2 > limit {
        return Err(BinaryXmlError::MalformedDocument(
            "Missing UTF-16 terminator".to_string(),
        ));
    }
    let terminator = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
    if terminator != 0 {
        return Err(BinaryXmlError::MalformedDocument(
            "UTF-16 string missing terminator".to_string(),
        ));
    }
    let text = String::from_utf16(&units)
        .map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))?;
    Ok(text)
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(BinaryXmlError::MalformedDocument(
            "Invalid UTF-8 length offset".to_string(),
        ));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(BinaryXmlError::MalformedDocument(
                "Truncated UTF-8 length".to_string(),
            ));
        }
        let second = data[offset + 1];
        let length = (((first & 0x7F) as usize) << 8) | second as usize;
        Ok((length, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(BinaryXmlError::MalformedDocument(
            "Invalid UTF-16 length offset".to_string(),
        ));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(BinaryXmlError::MalformedDocument(
                "Truncated UTF-16 length".to_string(),
            ));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        let length = (((first & 0x7FFF) as usize) << 16) | second as usize;
        Ok((length, 4))
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> BinaryXmlResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(BinaryXmlError::MalformedDocument(
            "Truncated binary XML chunk header".to_string(),
        ));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 {
        return Err(BinaryXmlError::MalformedDocument(
            "Invalid chunk sizing in binary XML".to_string(),
        ));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| {
            BinaryXmlError::MalformedDocument("Chunk size overflow".to_string())
        })?;
    if end > reader.data.len() {
        return Err(BinaryXmlError::MalformedDocument(
            "Chunk extends past end of document".to_string(),
        ));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

fn resolve_prefix(namespaces: &[NamespaceFrame], uri: Option<&str>) -> Option<String> {
    uri.and_then(|target| {
        namespaces
            .iter()
            .rev()
            .find(|frame| frame.uri.as_deref() == Some(target))
            .and_then(|frame| frame.prefix.clone())
    })
}

fn decode_value(
    strings: &StringPool,
    raw_value_idx: u32,
    data_type: u8,
    data: u32,
) -> BinaryXmlResult<ManifestValue> {
    if let Some(raw) = strings.get(raw_value_idx) {
        return Ok(ManifestValue::String(raw.to_string()));
    }

    match data_type {
        TYPE_NULL => Ok(ManifestValue::String(String::new())),
        TYPE_STRING => strings
            .get(data)
            .map(|s| ManifestValue::String(s.to_string()))
            .ok_or_else(|| {
                BinaryXmlError::MalformedDocument(
                    "String value references missing pool entry".to_string(),
                )
            }),
        TYPE_REFERENCE => Ok(ManifestValue::Reference(data)),
        TYPE_INT_BOOLEAN => Ok(ManifestValue::Boolean(data != 0)),
        TYPE_INT_DEC => Ok(ManifestValue::Integer(i64::from(data as i32))),
        TYPE_INT_HEX => Ok(ManifestValue::Hex(data)),
        TYPE_FLOAT => {
            let value = f32::from_bits(data);
            Ok(ManifestValue::String(value.to_string()))
        }
        _ => Ok(ManifestValue::Hex(data)),
    }
}

fn parse_manifest_value(text: &str) -> ManifestValue {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        ManifestValue::Boolean(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        ManifestValue::Boolean(false)
    } else if let Some(hex) = trimmed.strip_prefix("@0x").or_else(|| trimmed.strip_prefix("@0X")) {
        if let Ok(value) = u32::from_str_radix(hex, 16) {
            ManifestValue::Reference(value)
        } else {
            ManifestValue::String(trimmed.to_string())
        }
    } else if let Some(decimal) = trimmed.strip_prefix('@') {
        if decimal.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(value) = decimal.parse::<u32>() {
                ManifestValue::Reference(value)
            } else {
                ManifestValue::String(trimmed.to_string())
            }
        } else {
            ManifestValue::String(trimmed.to_string())
        }
    } else if let Some(value) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        if let Ok(number) = u32::from_str_radix(value, 16) {
            ManifestValue::Hex(number)
        } else {
            ManifestValue::String(trimmed.to_string())
        }
    } else if let Ok(number) = trimmed.parse::<i64>() {
        ManifestValue::Integer(number)
    } else {
        ManifestValue::String(trimmed.to_string())
    }
}

/// Result alias for manifest decoding operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the manifest decoding helpers.
#[derive(Debug)]
pub enum BinaryXmlError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// Text XML parsing failure.
    Xml(String),
}

impl std::fmt::Display for BinaryXmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryXmlError::MalformedDocument(msg) => write!(f, "Malformed manifest: {msg}"),
            BinaryXmlError::Xml(msg) => write!(f, "XML error: {msg}"),
        }
    }
}

impl std::error::Error for BinaryXmlError {}

impl From<QuickXmlError> for BinaryXmlError {
    fn from(value: QuickXmlError) -> Self {
        BinaryXmlError::Xml(value.to_string())
    }
}

impl From<AttrError> for BinaryXmlError {
    fn from(value: AttrError) -> Self {
        BinaryXmlError::Xml(value.to_string())
    }
}

/// Typed attribute values inside the manifest DOM representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Hex(u32),
    Reference(u32),
}

impl ManifestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManifestValue::String(value) => Some(value),
            _ => None,
        }
    }
}

/// A single attribute attached to a manifest element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAttribute {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub name: String,
    pub value: ManifestValue,
}

/// DOM-style element node for the decoded manifest tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestElement {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub attributes: Vec<ManifestAttribute>,
    pub children: Vec<ManifestElement>,
    pub text: Option<String>,
}

impl ManifestElement {
    fn new(tag: impl Into<String>) -> Self {
        ManifestElement {
            namespace_prefix: None,
            namespace_uri: None,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Look up an attribute by query name. A `prefix:local` query matches on the
    /// namespace prefix, a bare name matches only un-namespaced attributes.
    pub fn attribute_value(&self, name: &str) -> Option<&ManifestValue> {
        let (namespace, local) = split_attribute_query(name);
        self.attributes
            .iter()
            .find(|attr| attr.name == local && attr.namespace_prefix.as_deref() == namespace)
            .map(|attr| &attr.value)
    }

    /// Look up an attribute by its namespace URI and local name. Falls back to
    /// matching the conventional prefix when the tree carries no resolvable URI
    /// for the attribute, so trees decoded from binary XML and trees parsed from
    /// text behave the same.
    pub fn namespaced_attribute_value(&self, uri: &str, name: &str) -> Option<&ManifestValue> {
        let prefix = known_prefix_for(uri);
        self.attributes
            .iter()
            .find(|attr| {
                attr.name == name
                    && match attr.namespace_uri.as_deref() {
                        Some(attr_uri) => attr_uri == uri,
                        None => prefix.is_some() && attr.namespace_prefix.as_deref() == prefix,
                    }
            })
            .map(|attr| &attr.value)
    }

    pub fn find_child(&self, tag: &str) -> Option<&ManifestElement> {
        self.children.iter().find(|child| child.tag == tag)
    }
}

fn known_prefix_for(uri: &str) -> Option<&'static str> {
    if uri == ANDROID_NAMESPACE_URI {
        Some("android")
    } else {
        None
    }
}

fn split_attribute_query(name: &str) -> (Option<&str>, &str) {
    if let Some((ns, local)) = name.split_once(':') {
        (Some(ns), local)
    } else {
        (None, name)
    }
}

fn attach_element(
    stack: &mut Vec<ManifestElement>,
    root: &mut Option<ManifestElement>,
    element: ManifestElement,
) -> BinaryXmlResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(BinaryXmlError::MalformedDocument(
            "Multiple root elements in manifest".to_string(),
        ));
    }
    Ok(())
}

fn parse_text_content(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_namespace_uri(
    stack: &[BTreeMap<String, String>],
    prefix: Option<&str>,
) -> Option<String> {
    let key = prefix.unwrap_or("");
    for frame in stack.iter().rev() {
        if let Some(uri) = frame.get(key) {
            return Some(uri.clone());
        }
    }
    None
}

fn split_qname_owned(name: &str) -> (Option<String>, String) {
    if let Some(idx) = name.find(':') {
        (
            Some(name[..idx].to_string()),
            name[idx + 1..].to_string(),
        )
    } else {
        (None, name.to_string())
    }
}

struct PendingAttribute {
    prefix: Option<String>,
    local_name: String,
    value: String,
}

fn extract_attributes(
    start: &BytesStart<'_>,
) -> BinaryXmlResult<(BTreeMap<String, String>, Vec<PendingAttribute>)> {
    let mut namespaces = BTreeMap::new();
    let mut attrs = Vec::new();
    for attr in start.attributes().with_checks(false) {
        let attr = attr.map_err(BinaryXmlError::from)?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(BinaryXmlError::from)?
            .into_owned();
        if key == "xmlns" {
            namespaces.insert(String::new(), value);
            continue;
        } else if let Some(rest) = key.strip_prefix("xmlns:") {
            namespaces.insert(rest.to_string(), value);
            continue;
        }
        let (prefix, local_name) = split_qname_owned(key);
        attrs.push(PendingAttribute {
            prefix,
            local_name,
            value,
        });
    }
    Ok((namespaces, attrs))
}

fn build_element_from_start(
    start: &BytesStart<'_>,
    ns_stack: &[BTreeMap<String, String>],
    attrs: Vec<PendingAttribute>,
) -> BinaryXmlResult<ManifestElement> {
    let name_ref = start.name();
    let raw_name = std::str::from_utf8(name_ref.as_ref())
        .map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))?;
    let (prefix, local) = split_qname_owned(raw_name);
    let namespace_uri = lookup_namespace_uri(ns_stack, prefix.as_deref());
    let mut element = ManifestElement::new(local);
    element.namespace_prefix = prefix;
    element.namespace_uri = namespace_uri;
    element.attributes = attrs
        .into_iter()
        .map(|attr| build_manifest_attribute(attr, ns_stack))
        .collect();
    Ok(element)
}

fn build_manifest_attribute(
    attr: PendingAttribute,
    ns_stack: &[BTreeMap<String, String>],
) -> ManifestAttribute {
    let namespace_uri = attr
        .prefix
        .as_deref()
        .and_then(|prefix| lookup_namespace_uri(ns_stack, Some(prefix)));
    ManifestAttribute {
        namespace_prefix: attr.prefix,
        namespace_uri,
        name: attr.local_name,
        value: parse_manifest_value(&attr.value),
    }
}

/// Decoded representation of `AndroidManifest.xml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AndroidManifest {
    root: ManifestElement,
}

impl AndroidManifest {
    pub fn root(&self) -> &ManifestElement {
        &self.root
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root.attribute_value("package").and_then(|value| value.as_str())
    }

    /// Parse a plain-text manifest into the same tree shape as [`Self::from_bytes`].
    pub fn from_string(xml: &str) -> BinaryXmlResult<Self> {
        let mut reader = Reader::from_reader(xml.as_bytes());
        reader.config_mut().trim_text(true);
        let mut buffer = Vec::new();
        let mut stack: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;
        let mut namespace_stack: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];

        loop {
            match reader.read_event_into(&mut buffer)? {
                Event::Start(start) => {
                    let start = start.into_owned();
                    let (decls, attrs) = extract_attributes(&start)?;
                    namespace_stack.push(decls);
                    let element = build_element_from_start(&start, &namespace_stack, attrs)?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let start = start.into_owned();
                    let (decls, attrs) = extract_attributes(&start)?;
                    namespace_stack.push(decls);
                    let element = build_element_from_start(&start, &namespace_stack, attrs)?;
                    attach_element(&mut stack, &mut root, element)?;
                    if namespace_stack.len() <= 1 {
                        return Err(BinaryXmlError::MalformedDocument(
                            "Namespace stack underflow".to_string(),
                        ));
                    }
                    namespace_stack.pop();
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        BinaryXmlError::MalformedDocument(
                            "Unbalanced end tag in manifest".to_string(),
                        )
                    })?;
                    if namespace_stack.len() <= 1 {
                        return Err(BinaryXmlError::MalformedDocument(
                            "Namespace stack underflow".to_string(),
                        ));
                    }
                    namespace_stack.pop();
                    attach_element(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = text.unescape()?.into_owned();
                        if let Some(content) = parse_text_content(&raw) {
                            match &mut current.text {
                                Some(existing) => {
                                    if !existing.is_empty() {
                                        existing.push(' ');
                                    }
                                    existing.push_str(&content);
                                }
                                None => current.text = Some(content),
                            }
                        }
                    }
                }
                Event::CData(text) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = std::str::from_utf8(text.as_ref())
                            .map_err(|err| {
                                BinaryXmlError::MalformedDocument(err.to_string())
                            })?
                            .to_string();
                        if let Some(content) = parse_text_content(&raw) {
                            current.text = Some(content);
                        }
                    }
                }
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
            buffer.clear();
        }

        if !stack.is_empty() {
            return Err(BinaryXmlError::MalformedDocument(
                "Unclosed XML elements in manifest".to_string(),
            ));
        }

        if namespace_stack.len() != 1 {
            return Err(BinaryXmlError::MalformedDocument(
                "Mismatched namespace scopes in manifest".to_string(),
            ));
        }

        let root = root.ok_or_else(|| {
            BinaryXmlError::MalformedDocument("Manifest does not have a root element".to_string())
        })?;

        Ok(AndroidManifest { root })
    }

    /// Decode an Android binary XML document into a DOM tree.
    pub fn from_bytes(bytes: &[u8]) -> BinaryXmlResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let xml_header = read_chunk_header(&mut reader)?;
        if xml_header.chunk_type != RES_XML_TYPE {
            return Err(BinaryXmlError::MalformedDocument(
                "Binary XML does not start with RES_XML_TYPE header".to_string(),
            ));
        }

        let xml_end = xml_header.end();
        reader.seek(xml_header.start + xml_header.header_size as usize)?;

        let mut string_pool: Option<StringPool> = None;
        let mut namespaces: Vec<NamespaceFrame> = Vec::new();
        let mut element_stack: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;

        while reader.position() < xml_end {
            let chunk_header = read_chunk_header(&mut reader)?;
            let chunk_end = chunk_header.end();
            match chunk_header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    string_pool = Some(StringPool::parse(&mut reader, &chunk_header)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    // Attribute resource ids are irrelevant for metadata extraction.
                }
                RES_XML_START_NAMESPACE_TYPE => {
                    let pool = string_pool
                        .as_ref()
                        .ok_or_else(|| BinaryXmlError::MalformedDocument(
                            "Namespace chunk encountered before string pool".to_string(),
                        ))?;
                    reader.read_u32()?; // line number
                    reader.read_u32()?; // comment
                    let prefix_idx = reader.read_u32()?;
                    let uri_idx = reader.read_u32()?;
                    let prefix = pool.get(prefix_idx).map(|s| s.to_string());
                    let uri = pool.get(uri_idx).map(|s| s.to_string());
                    namespaces.push(NamespaceFrame { prefix, uri });
                }
                RES_XML_END_NAMESPACE_TYPE => {
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    namespaces.pop();
                }
                RES_XML_START_ELEMENT_TYPE => {
                    let pool = string_pool
                        .as_ref()
                        .ok_or_else(|| BinaryXmlError::MalformedDocument(
                            "Start element encountered before string pool".to_string(),
                        ))?;

                    reader.read_u32()?; // line number
                    reader.read_u32()?; // comment index
                    let ns_idx = reader.read_u32()?;
                    let name_idx = reader.read_u32()?;
                    reader.read_u16()?; // attributeStart
                    reader.read_u16()?; // attributeSize
                    let attr_count = reader.read_u16()? as usize;
                    reader.read_u16()?; // idIndex
                    reader.read_u16()?; // classIndex
                    reader.read_u16()?; // styleIndex

                    let tag_name = pool
                        .get(name_idx)
                        .ok_or_else(|| {
                            BinaryXmlError::MalformedDocument(
                                "Element references invalid string index".to_string(),
                            )
                        })?
                        .to_string();

                    let namespace_uri = pool.get(ns_idx).map(|s| s.to_string());
                    let namespace_prefix = resolve_prefix(&namespaces, namespace_uri.as_deref());
                    let mut element = ManifestElement::new(tag_name);
                    element.namespace_prefix = namespace_prefix;
                    element.namespace_uri = namespace_uri;

                    let mut attributes = Vec::with_capacity(attr_count);
                    for _ in 0..attr_count {
                        let attr_ns_idx = reader.read_u32()?;
                        let attr_name_idx = reader.read_u32()?;
                        let raw_value_idx = reader.read_u32()?;
                        let value_size = reader.read_u16()?;
                        reader.read_u8()?; // res0
                        let data_type = reader.read_u8()?;
                        let data = reader.read_u32()?;
                        if value_size != 8 {
                            return Err(BinaryXmlError::MalformedDocument(
                                "Attribute value size must be 8".to_string(),
                            ));
                        }
                        let attr_name = pool
                            .get(attr_name_idx)
                            .ok_or_else(|| {
                                BinaryXmlError::MalformedDocument(
                                    "Attribute name references invalid string index".to_string(),
                                )
                            })?
                            .to_string();
                        let attr_namespace_uri = pool.get(attr_ns_idx).map(|s| s.to_string());
                        let attr_namespace =
                            resolve_prefix(&namespaces, attr_namespace_uri.as_deref());
                        let value = decode_value(pool, raw_value_idx, data_type, data)?;
                        attributes.push(ManifestAttribute {
                            namespace_prefix: attr_namespace,
                            namespace_uri: attr_namespace_uri,
                            name: attr_name,
                            value,
                        });
                    }
                    element.attributes = attributes;
                    element_stack.push(element);
                }
                RES_XML_END_ELEMENT_TYPE => {
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    if let Some(element) = element_stack.pop() {
                        if let Some(parent) = element_stack.last_mut() {
                            parent.children.push(element);
                        } else {
                            root = Some(element);
                        }
                    } else {
                        return Err(BinaryXmlError::MalformedDocument(
                            "End element without matching start".to_string(),
                        ));
                    }
                }
                RES_XML_CDATA_TYPE => {
                    let pool = string_pool
                        .as_ref()
                        .ok_or_else(|| BinaryXmlError::MalformedDocument(
                            "CDATA encountered before string pool".to_string(),
                        ))?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    let data_idx = reader.read_u32()?;
                    let value_size = reader.read_u16()?;
                    reader.read_u8()?;
                    let data_type = reader.read_u8()?;
                    let data = reader.read_u32()?;
                    if value_size != 8 {
                        return Err(BinaryXmlError::MalformedDocument(
                            "CDATA value size must be 8".to_string(),
                        ));
                    }
                    if let Some(text) = pool
                        .get(data_idx)
                        .map(|s| s.to_string())
                        .or_else(|| {
                            if data_type == TYPE_STRING {
                                pool.get(data).map(|s| s.to_string())
                            } else {
                                None
                            }
                        })
                    {
                        if let Some(current) = element_stack.last_mut() {
                            current.text = Some(text);
                        }
                    }
                }
                other => {
                    warn!("Skipping unknown binary XML chunk type 0x{other:04x}");
                }
            }
            reader.seek(chunk_end)?;
        }

        if !element_stack.is_empty() {
            return Err(BinaryXmlError::MalformedDocument(
                "Unclosed XML elements at end of document".to_string(),
            ));
        }

        let root = root.ok_or_else(|| {
            BinaryXmlError::MalformedDocument("AndroidManifest is empty".to_string())
        })?;

        debug!("Decoded binary manifest with root element <{}>", root.tag);
        Ok(AndroidManifest { root })
    }
}
