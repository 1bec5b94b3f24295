//! Authoritative catalog parser
//!
//! Parses the bulk XML catalog: a tree with one repeated `<product>` element per
//! record. Each product needs an `id` (or `objectID`) and a `name`; products without
//! them are rejected and parsing continues.
//!
//! Type coercion:
//!
//! - `price` becomes a float and also yields a bucketed `price_range`
//! - `rating` and `popularity` become integers
//! - `free_shipping` becomes a boolean (`true` or `1`)
//! - `categories` is always a list, whether given once or as repeated children
//! - `hierarchicalCategories` levels keep `>` as the separator, including when the
//!   feed double-escaped it as `&amp;gt;`
//!
//! Any other element is kept: text as a string, children as a nested object.
//! Attributes on an element with text are ignored; on an element without text they
//! become keys of its object. Attributes on `<product>` itself are read as fields.

use flate2::read::GzDecoder;
use prodsync_common::{normalize_id, WireRecord};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::io::Read;
use tracing::{debug, warn};

use super::enrichment::PROVENANCE_FIELDS;
use super::{ParseRejection, ParseReport, ParsedRecord};
use crate::error::ParseError;

/// Element repeated once per product
pub const PRODUCT_ELEMENT: &str = "product";

/// Upper bounds of every price bucket but the last, with their labels
const PRICE_BUCKETS: [(f64, &str); 5] = [
    (50.0, "1-50"),
    (100.0, "50-100"),
    (200.0, "100-200"),
    (500.0, "200-500"),
    (1000.0, "500-1000"),
];

const TOP_PRICE_BUCKET: &str = "1000+";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Bucket a numeric price. Prices below 50, zero included, land in `"1-50"`.
pub fn price_range(price: f64) -> &'static str {
    PRICE_BUCKETS
        .iter()
        .find(|(upper, _)| price < *upper)
        .map(|(_, label)| *label)
        .unwrap_or(TOP_PRICE_BUCKET)
}

/// Parse a complete catalog document, gzip-compressed or not.
pub fn parse_catalog(bytes: &[u8]) -> Result<ParseReport, ParseError> {
    let xml = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut decoded)
            .map_err(ParseError::Decompress)?;
        debug!(compressed = bytes.len(), decompressed = decoded.len(), "Decompressed catalog");
        decoded
    } else {
        bytes.to_vec()
    };

    let root = read_tree(&xml)?;
    let mut products = Vec::new();
    collect_products(&root, &mut products);

    let mut report = ParseReport::default();
    for (index, product) in products.into_iter().enumerate() {
        match convert_product(product) {
            Ok(record) => report.accept(record),
            Err((id, reason)) => report.reject(ParseRejection::new(index, id, reason)),
        }
    }

    debug!(
        accepted = report.records.len(),
        rejected = report.rejections.len(),
        "Parsed catalog"
    );
    Ok(report)
}

/// Element tree; attributes are kept apart from child elements
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let mut node = Node {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            ..Default::default()
        };
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            node.attributes.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                attr.unescape_value()?.into_owned(),
            ));
        }
        Ok(node)
    }

    fn leaf(name: &str, text: &str) -> Self {
        Node {
            name: name.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn trimmed(&self) -> &str {
        self.text.trim()
    }
}

fn read_tree(xml: &[u8]) -> Result<Node, ParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let xml_error = |reader: &Reader<&[u8]>, reason: String| ParseError::Xml {
        position: reader.buffer_position() as u64,
        reason,
    };

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_error(&reader, e.to_string()))?;

        match event {
            Event::Start(start) => {
                let node = Node::open(&start).map_err(|e| xml_error(&reader, e.to_string()))?;
                stack.push(node);
            },
            Event::Empty(start) => {
                let node = Node::open(&start).map_err(|e| xml_error(&reader, e.to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            },
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| xml_error(&reader, e.to_string()))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            },
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            },
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| xml_error(&reader, "unbalanced closing tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(xml_error(&reader, "document ended inside an open element".to_string()));
    }
    root.ok_or_else(|| xml_error(&reader, "document has no root element".to_string()))
}

fn collect_products<'a>(node: &'a Node, out: &mut Vec<&'a Node>) {
    if node.name == PRODUCT_ELEMENT {
        out.push(node);
        return;
    }
    for child in &node.children {
        collect_products(child, out);
    }
}

fn convert_product(product: &Node) -> Result<ParsedRecord, (Option<String>, String)> {
    let mut id = None;
    let mut fields = WireRecord::new();
    let mut categories: Option<Vec<Value>> = None;

    let attributes: Vec<Node> = product
        .attributes
        .iter()
        .map(|(key, value)| Node::leaf(key, value))
        .collect();

    for child in attributes.iter().chain(&product.children) {
        let name = child.name.as_str();
        if PROVENANCE_FIELDS.contains(&name) {
            warn!(field = name, "Dropping event provenance from catalog product");
            continue;
        }
        match name {
            "id" | "objectID" => id = normalize_id(&Value::String(child.text.clone())),
            "price" => match child.trimmed().parse::<f64>() {
                Ok(price) if price.is_finite() => {
                    fields.insert("price".to_string(), Value::from(price));
                    fields.insert("price_range".to_string(), Value::from(price_range(price)));
                },
                _ => warn!(value = %child.trimmed(), "Dropping non-numeric price"),
            },
            "rating" | "popularity" => match parse_integer(child.trimmed()) {
                Some(n) => {
                    fields.insert(name.to_string(), Value::from(n));
                },
                None => warn!(field = name, value = %child.trimmed(), "Dropping non-integer value"),
            },
            "free_shipping" => {
                fields.insert(name.to_string(), Value::Bool(parse_flag(child.trimmed())));
            },
            "categories" => {
                let list = categories.get_or_insert_with(Vec::new);
                if child.children.is_empty() {
                    if !child.trimmed().is_empty() {
                        list.push(Value::from(decode_separators(child.trimmed())));
                    }
                } else {
                    list.extend(
                        child
                            .children
                            .iter()
                            .map(|c| Value::from(decode_separators(c.trimmed()))),
                    );
                }
            },
            "hierarchicalCategories" => {
                let levels: Map<String, Value> = child
                    .children
                    .iter()
                    .map(|level| {
                        (level.name.clone(), Value::from(decode_separators(level.trimmed())))
                    })
                    .collect();
                fields.insert(name.to_string(), Value::Object(levels));
            },
            _ => insert_repeated(&mut fields, name, generic_value(child)),
        }
    }

    if let Some(list) = categories {
        fields.insert("categories".to_string(), Value::Array(list));
    }

    let id = id.ok_or_else(|| (None, "missing id".to_string()))?;
    let has_name = fields
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|n| !n.trim().is_empty());
    if !has_name {
        return Err((Some(id), "missing name".to_string()));
    }

    Ok(ParsedRecord::new(id, fields))
}

fn generic_value(node: &Node) -> Value {
    let is_leaf = node.children.is_empty();
    if is_leaf && (node.attributes.is_empty() || !node.trimmed().is_empty()) {
        return Value::from(node.trimmed());
    }
    let mut object = Map::new();
    for (key, value) in &node.attributes {
        insert_repeated(&mut object, key, Value::from(value.as_str()));
    }
    for child in &node.children {
        insert_repeated(&mut object, &child.name, generic_value(child));
    }
    Value::Object(object)
}

/// Insert `value`, turning a repeated key into a list
fn insert_repeated(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        },
        None => {
            map.insert(key.to_string(), value);
        },
    }
}

fn parse_integer(text: &str) -> Option<i64> {
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
}

fn parse_flag(text: &str) -> bool {
    text.eq_ignore_ascii_case("true") || text == "1"
}

/// Undo leftover escaping of the level separator
fn decode_separators(text: &str) -> String {
    text.replace("&gt;", ">")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    const CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<products>
  <product>
    <id>1696302</id>
    <name>Catalog Name</name>
    <price>70</price>
    <rating>4</rating>
    <popularity>21469</popularity>
    <free_shipping>1</free_shipping>
    <categories>Appliances</categories>
    <hierarchicalCategories>
      <lvl0>Appliances</lvl0>
      <lvl1>Appliances &gt; Dishwashers</lvl1>
      <lvl2>Appliances &amp;gt; Dishwashers &amp;gt; Built-In</lvl2>
    </hierarchicalCategories>
    <brand>Acme</brand>
  </product>
  <product>
    <objectID>1696303</objectID>
    <name>Second</name>
    <price>1500.5</price>
    <free_shipping>false</free_shipping>
    <categories>
      <category>TV</category>
      <category>Audio</category>
    </categories>
  </product>
  <product>
    <name>No identifier</name>
  </product>
  <product>
    <id>1696305</id>
  </product>
</products>"#;

    #[test]
    fn test_price_buckets() {
        assert_eq!(price_range(70.0), "50-100");
        assert_eq!(price_range(0.0), "1-50");
        assert_eq!(price_range(1500.0), "1000+");
        assert_eq!(price_range(50.0), "50-100");
        assert_eq!(price_range(999.99), "500-1000");
        assert_eq!(price_range(1000.0), "1000+");
    }

    #[test]
    fn test_parse_catalog_coerces_types() {
        let report = parse_catalog(CATALOG.as_bytes()).unwrap();
        assert_eq!(report.records.len(), 2);

        let first = &report.records[0];
        assert_eq!(first.id, "1696302");
        assert_eq!(first.fields["name"], "Catalog Name");
        assert_eq!(first.fields["price"], json!(70.0));
        assert_eq!(first.fields["price_range"], "50-100");
        assert_eq!(first.fields["rating"], json!(4));
        assert_eq!(first.fields["popularity"], json!(21469));
        assert_eq!(first.fields["free_shipping"], json!(true));
        assert_eq!(first.fields["categories"], json!(["Appliances"]));
        assert_eq!(first.fields["brand"], "Acme");

        let second = &report.records[1];
        assert_eq!(second.id, "1696303");
        assert_eq!(second.fields["price_range"], "1000+");
        assert_eq!(second.fields["free_shipping"], json!(false));
        assert_eq!(second.fields["categories"], json!(["TV", "Audio"]));
    }

    #[test]
    fn test_hierarchical_separators_decoded() {
        let report = parse_catalog(CATALOG.as_bytes()).unwrap();
        let levels = &report.records[0].fields["hierarchicalCategories"];

        assert_eq!(levels["lvl0"], "Appliances");
        assert_eq!(levels["lvl1"], "Appliances > Dishwashers");
        assert_eq!(levels["lvl2"], "Appliances > Dishwashers > Built-In");
    }

    #[test]
    fn test_missing_id_or_name_rejected() {
        let report = parse_catalog(CATALOG.as_bytes()).unwrap();
        assert_eq!(report.rejections.len(), 2);
        assert_eq!(report.rejections[0].index, 2);
        assert_eq!(report.rejections[0].reason, "missing id");
        assert_eq!(report.rejections[1].id.as_deref(), Some("1696305"));
        assert_eq!(report.rejections[1].reason, "missing name");
    }

    #[test]
    fn test_gzip_document() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(CATALOG.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let report = parse_catalog(&compressed).unwrap();
        assert_eq!(report.records.len(), 2);
    }

    #[test]
    fn test_attributes_and_nested_elements() {
        let xml = r#"<catalog><product id="9"><name>Attr</name>
            <dimensions><width>10</width><height>20</height></dimensions>
            <tag>a</tag><tag>b</tag><description/></product></catalog>"#;
        let report = parse_catalog(xml.as_bytes()).unwrap();
        let record = &report.records[0];

        assert_eq!(record.id, "9");
        assert_eq!(record.fields["dimensions"], json!({ "width": "10", "height": "20" }));
        assert_eq!(record.fields["tag"], json!(["a", "b"]));
        assert_eq!(record.fields["description"], "");
    }

    #[test]
    fn test_attributes_on_leaf_elements_keep_text() {
        let xml = r#"<products><product><id>1</id><name lang="en">Widget</name>
            <price currency="USD">70</price><brand code="x">Acme</brand>
            <image url="a.jpg" width="40"/><size unit="cm"><w>3</w></size></product></products>"#;
        let report = parse_catalog(xml.as_bytes()).unwrap();

        assert!(report.rejections.is_empty());
        let record = &report.records[0];
        assert_eq!(record.fields["name"], "Widget");
        assert_eq!(record.fields["price"], json!(70.0));
        assert_eq!(record.fields["price_range"], "50-100");
        assert_eq!(record.fields["brand"], "Acme");
        assert_eq!(record.fields["image"], json!({ "url": "a.jpg", "width": "40" }));
        assert_eq!(record.fields["size"], json!({ "unit": "cm", "w": "3" }));
    }

    #[test]
    fn test_provenance_elements_are_dropped() {
        let xml = r#"<products><product _event_partition="2"><id>1</id><name>N</name>
            <_event_offset>0</_event_offset></product></products>"#;
        let report = parse_catalog(xml.as_bytes()).unwrap();

        let record = &report.records[0];
        assert!(!record.fields.contains_key("_event_offset"));
        assert!(!record.fields.contains_key("_event_partition"));
        assert_eq!(record.fields["name"], "N");
    }

    #[test]
    fn test_malformed_document_is_error() {
        let err = parse_catalog(b"<products><product><id>1</id></products>").unwrap_err();
        assert!(matches!(err, ParseError::Xml { .. }));

        let err = parse_catalog(b"<products><product>").unwrap_err();
        assert!(matches!(err, ParseError::Xml { .. }));
    }
}
