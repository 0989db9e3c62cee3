use std::fs::File;
use std::io::{stdout, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use handlebars::handlebars_helper;
use serde::Serialize;
use spackit::aggregate::{Decoded, Diagnostics, Table};
use spackit::decode::Value;
use spackit::layout::JsonDefinitions;
use spackit::pipeline::{decode_stream, DecodeOpts};
use spackit::registry::{DefinitionRegistry, PacketDefinitions, RegistryBuilder};
use spackit::spacepacket::Apid;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

#[derive(Debug, Serialize)]
struct Output<'a> {
    filename: String,
    diagnostics: &'a Diagnostics,
    tables: Vec<&'a Table>,
}

#[derive(Debug, Serialize)]
struct TextTable {
    apid: Apid,
    name: String,
    columns: Vec<String>,
    rows: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TextOutput<'a> {
    filename: String,
    diagnostics: &'a Diagnostics,
    tables: Vec<TextTable>,
}

fn load_registry(layouts: &[PathBuf], include: &[Apid]) -> Result<DefinitionRegistry> {
    let mut builder = RegistryBuilder::new();
    for path in layouts {
        let definitions = JsonDefinitions::from_path(path)
            .with_context(|| format!("loading layouts from {path:?}"))?;
        for layout in definitions.layouts() {
            if !include.is_empty() && !include.contains(&layout.apid) {
                debug!(apid = layout.apid, "layout not included");
                continue;
            }
            builder
                .register(layout)
                .with_context(|| format!("registering layouts from {path:?}"))?;
        }
    }
    let registry = builder.build();
    if registry.is_empty() {
        bail!("no layouts to decode with");
    }
    debug!("registered apids {:?}", registry.apids());
    Ok(registry)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Unsigned(v) => v.to_string(),
        Value::Signed(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Flag(v) => v.to_string(),
        Value::Bytes(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
        Value::OutOfRange => "-".to_string(),
    }
}

fn text_table(table: &Table) -> TextTable {
    TextTable {
        apid: table.apid,
        name: table.name.clone().unwrap_or_default(),
        columns: table
            .columns
            .iter()
            .map(|c| match c.unit {
                Some(ref unit) => format!("{}[{unit}]", c.name),
                None => c.name.clone(),
            })
            .collect(),
        rows: table
            .records
            .iter()
            .map(|r| {
                r.values()
                    .map(format_value)
                    .collect::<Vec<String>>()
                    .join("\t")
            })
            .collect(),
    }
}

fn render_text(output: &TextOutput) -> Result<String> {
    handlebars_helper!(join: |v: Json| {
        match v {
            serde_json::Value::Array(items) => items
                .iter()
                .map(|i| match i {
                    serde_json::Value::String(s) => s.to_owned(),
                    _ => i.to_string(),
                })
                .collect::<Vec<String>>()
                .join("\t"),
            _ => v.to_string(),
        }
    });
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("join", Box::new(join));
    hb.register_template_string("decode", TEXT_TEMPLATE)
        .context("compiling text template")?;

    hb.render("decode", output).context("rendering text")
}

pub fn decode(
    input: &Path,
    layouts: &[PathBuf],
    include: &[Apid],
    opts: &DecodeOpts,
    format: &Format,
) -> Result<()> {
    let registry = load_registry(layouts, include)?;
    let reader = BufReader::new(File::open(input).context("opening input")?);

    info!("decoding {input:?}");
    let decoded: Decoded = decode_stream(reader, &registry, opts).context("decoding")?;
    let diagnostics = &decoded.diagnostics;

    if let Some(ref err) = decoded.framing_error {
        if diagnostics.packets == 0 {
            bail!("no packets could be framed: {err}");
        }
        warn!("framing stopped after {} packets: {err}", diagnostics.packets);
    }
    if diagnostics.unknown_packets() > 0 {
        info!(
            "skipped {} packets with no layout: apids {:?}",
            diagnostics.unknown_packets(),
            diagnostics.unknown_apids.keys().collect::<Vec<_>>()
        );
    }
    if diagnostics.out_of_range_fields > 0 {
        warn!(
            "{} fields in {} records did not fit their packet",
            diagnostics.out_of_range_fields, diagnostics.flagged_records
        );
    }

    let filename = input.to_string_lossy().to_string();
    match format {
        Format::Json => {
            let output = Output {
                filename,
                diagnostics,
                tables: decoded.tables.values().collect(),
            };
            serde_json::to_writer_pretty(stdout(), &output).context("serializing to json")
        }
        Format::Text => {
            let output = TextOutput {
                filename,
                diagnostics,
                tables: decoded.tables.values().map(text_table).collect(),
            };
            let data = render_text(&output)?;
            stdout()
                .write_all(data.as_bytes())
                .context("writing to stdout")
        }
    }
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
===============================================================================================
Packets:       {{ diagnostics.packets }}
Records:       {{ diagnostics.records }}
Unknown APIDs: {{ #each diagnostics.unknown_apids }}{{ @key }}({{ this }}){{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
Gaps:          {{ #each diagnostics.sequence_gaps }}{{ @key }}({{ this }}){{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
Out of range:  {{ diagnostics.out_of_range_fields }}
Mismatched:    {{ diagnostics.layout_mismatches }}
{{ #if diagnostics.terminal_error }}Error:         {{ diagnostics.terminal_error }}
{{ /if }}{{ #each tables }}
-----------------------------------------------------------------------------------------------
APID {{ apid }} {{ name }}
-----------------------------------------------------------------------------------------------
{{ join columns }}
{{ #each rows }}{{ this }}
{{ /each }}{{ /each }}";

#[cfg(test)]
mod tests {
    use super::*;
    use spackit::layout::{FieldSpec, PacketLayout, ValueType};
    use spackit::pipeline::decode_sequential;

    #[test]
    fn render_decoded_text() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                PacketLayout::new(
                    1369,
                    vec![
                        FieldSpec::new("A", 0, 8, ValueType::Unsigned),
                        FieldSpec::new("B", 8, 8, ValueType::Bytes),
                    ],
                )
                .with_name("TEST"),
            )
            .unwrap();
        let registry = builder.build();
        let dat: &[u8] = &[0xd, 0x59, 0xc0, 0x01, 0x0, 0x1, 0x2a, 0xff];
        let decoded = decode_sequential(dat, &registry, &DecodeOpts::new());

        let output = TextOutput {
            filename: "test.dat".to_string(),
            diagnostics: &decoded.diagnostics,
            tables: decoded.tables.values().map(text_table).collect(),
        };
        let text = render_text(&output).unwrap();

        assert!(text.contains("APID 1369 TEST"), "{text}");
        assert!(text.contains("A\tB\n"), "{text}");
        assert!(text.contains("42\tff\n"), "{text}");
    }

    #[test]
    fn registry_honors_include() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("layouts.json");
        std::fs::write(
            &path,
            r#"[
                {"apid": 1, "fields": [{"name": "X", "bit_offset": 0, "bit_width": 8, "value_type": "unsigned"}]},
                {"apid": 2, "fields": [{"name": "X", "bit_offset": 0, "bit_width": 8, "value_type": "unsigned"}]}
            ]"#,
        )
        .unwrap();

        let registry = load_registry(&[path.clone()], &[2]).unwrap();
        assert_eq!(registry.apids(), vec![2]);

        assert!(load_registry(&[path], &[3]).is_err());
    }
}
