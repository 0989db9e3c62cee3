use std::fs::File;
use std::io::{stdout, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use handlebars::handlebars_helper;
use serde::Serialize;
use spackit::spacepacket::{frame_packets, Summary};
use tracing::warn;

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

#[derive(Debug, Clone, Serialize)]
struct Info {
    filename: String,
    summary: Summary,
    error: Option<String>,
}

fn summarize(fpath: &Path) -> Result<Info> {
    let reader = BufReader::new(File::open(fpath).context("opening input")?);
    let mut summary = Summary::default();
    let mut error = None;

    for zult in frame_packets(reader) {
        match zult {
            Ok(packet) => summary.add(&packet),
            Err(err) => {
                warn!("framing stopped after {} packets: {err}", summary.count);
                error = Some(err.to_string());
            }
        }
    }

    Ok(Info {
        filename: fpath.to_string_lossy().to_string(),
        summary,
        error,
    })
}

pub fn info(fpath: &Path, format: &Format) -> Result<()> {
    let info = summarize(fpath)?;

    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &info).context("serializing to json")
        }
        Format::Text => {
            let data = render_text(&info).context("serializing info")?;
            stdout()
                .write_all(str::as_bytes(&data))
                .context("writing to stdout")
        }
    }
}

fn render_text(info: &Info) -> Result<String> {
    handlebars_helper!(left_pad: |num: u64, v: Json| {
        let v = match v {
            serde_json::Value::String(s) => s.to_owned(),
            serde_json::Value::Null => String::new(),
            _ => v.to_string()
        };
        let width = usize::try_from(num).unwrap_or(0).max(v.len());
        format!("{v:>width$}")
    });
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("lpad", Box::new(left_pad));
    hb.register_template_string("info", TEXT_TEMPLATE)
        .context("compiling text template")?;

    hb.render("info", &info).context("rendering text")
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
===============================================================================================
APIDS:    {{ #each summary.apids }}{{ @key }}{{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
Count:    {{ summary.count }}
Bytes:    {{ summary.bytes }}
Missing:  {{ summary.missing }}
{{ #if error }}Error:    {{ error }}
{{ /if }}-----------------------------------------------------------------------------------------------
APID       First        Last       Count        Bytes   Missing
-----------------------------------------------------------------------------------------------
{{ #each summary.apids }}{{ lpad 4 @key }}  {{ lpad 10 first_sequence_id }}  {{ lpad 10 last_sequence_id }}  {{ lpad 10 count }}  {{ lpad 11 bytes }}  {{ lpad 8 missing }}
{{/each }}
";
