use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::environment::{EnvirocodingResult, ServiceMetadata};
use crate::report::LoadSummary;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_result(result: &EnvirocodingResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_summary(summary: &LoadSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_services(services: &BTreeMap<String, ServiceMetadata>) -> io::Result<()> {
        Self::print_json(services)
    }

    pub fn render<T: Serialize>(value: &T) -> io::Result<String> {
        serde_json::to_string_pretty(value).map_err(io::Error::other)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = Self::render(value)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
