/// CSV export, restore and request import
///
/// Fields are comma separated and quoted with `"` when they contain a comma,
/// a quote or a line break. A quoted field may span several lines.

use crate::record::{Record, UrlRequest, RECORD_CSV_HEADER};
use crate::{Error, Result};
use std::io::{BufRead, Write};

const DELIMITER: char = ',';
const QUOTE: char = '"';

/// Quote a single field when it needs it
pub fn quote_field(value: &str) -> String {
    let needs_quoting = value.contains(DELIMITER)
        || value.contains(QUOTE)
        || value.contains('\n')
        || value.contains('\r');

    if needs_quoting {
        let escaped = value.replace(QUOTE, "\"\"");
        format!("{}{}{}", QUOTE, escaped, QUOTE)
    } else {
        value.to_string()
    }
}

/// Parse one logical CSV line into fields.
/// Returns None if a quoted field is left open.
pub fn parse_csv_line(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        if chars.peek() == Some(&QUOTE) {
            chars.next();
            let mut field = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == QUOTE {
                    if chars.peek() == Some(&QUOTE) {
                        chars.next();
                        field.push(QUOTE);
                    } else {
                        closed = true;
                        break;
                    }
                } else {
                    field.push(c);
                }
            }
            if !closed {
                return None;
            }
            fields.push(field);
            match chars.next() {
                Some(DELIMITER) => {}
                None => break,
                _ => return None,
            }
        } else {
            let mut field = String::new();
            loop {
                match chars.next() {
                    Some(DELIMITER) => break,
                    Some(c) => field.push(c),
                    None => {
                        fields.push(field);
                        return Some(fields);
                    }
                }
            }
            fields.push(field);
        }
    }

    Some(fields)
}

fn write_row(writer: &mut dyn Write, fields: &[String]) -> Result<()> {
    let line = fields
        .iter()
        .map(|f| quote_field(f))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(writer, "{}", line)?;
    Ok(())
}

/// Rows of a CSV stream with the line number each row starts on
pub struct CsvRows<R> {
    reader: R,
    line: usize,
}

impl<R: BufRead> CsvRows<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }
}

impl<R: BufRead> Iterator for CsvRows<R> {
    type Item = Result<(usize, Vec<String>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buffer = String::new();
        let mut start = 0;
        loop {
            let mut chunk = String::new();
            let read = match self.reader.read_line(&mut chunk) {
                Ok(n) => n,
                Err(e) => return Some(Err(e.into())),
            };
            if read == 0 {
                if buffer.is_empty() {
                    return None;
                }
                return Some(Err(Error::InvalidRecord {
                    line: start,
                    reason: "unterminated quoted field".to_string(),
                }));
            }
            self.line += 1;
            if buffer.is_empty() {
                start = self.line;
                if chunk.trim().is_empty() {
                    continue;
                }
            }
            buffer.push_str(&chunk);

            let logical = buffer.trim_end_matches(&['\n', '\r'][..]);
            if let Some(fields) = parse_csv_line(logical) {
                return Some(Ok((start, fields)));
            }
            // a quoted field continues on the next line
            if logical.matches(QUOTE).count() % 2 == 0 {
                return Some(Err(Error::InvalidRecord {
                    line: start,
                    reason: "malformed quoting".to_string(),
                }));
            }
        }
    }
}

/// Write every record as one row, optionally preceded by the header row.
/// Returns the number of records written.
pub fn export_records<'a>(
    writer: &mut dyn Write,
    records: impl IntoIterator<Item = &'a Record>,
    header: bool,
) -> Result<u64> {
    if header {
        let names: Vec<String> = RECORD_CSV_HEADER.iter().map(|s| s.to_string()).collect();
        write_row(writer, &names)?;
    }
    let mut count = 0;
    for record in records {
        write_row(writer, &record.to_csv_row())?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Read records written by [`export_records`], one row at a time. A first
/// row starting with `id` is a header.
pub fn read_records(reader: impl BufRead) -> impl Iterator<Item = Result<(usize, Record)>> {
    CsvRows::new(reader).filter_map(|row| {
        let (line, fields) = match row {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        if line == 1 && fields.first().map(String::as_str) == Some(RECORD_CSV_HEADER[0]) {
            return None;
        }
        Some(
            Record::from_csv_row(&fields)
                .map(|record| (line, record))
                .map_err(|reason| Error::InvalidRecord { line, reason }),
        )
    })
}

/// Read import rows `url,id,max_requests,ttl,expire_on` one at a time, with
/// the line each came from. A first row starting with `url` is a header.
pub fn read_requests(reader: impl BufRead) -> impl Iterator<Item = Result<(usize, UrlRequest)>> {
    let mut first = true;
    CsvRows::new(reader).filter_map(move |row| {
        let is_first = std::mem::replace(&mut first, false);
        let (line, fields) = match row {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        if is_first
            && fields
                .first()
                .map_or(false, |f| f.trim().eq_ignore_ascii_case("url"))
        {
            return None;
        }
        Some(
            UrlRequest::from_csv_row(&fields)
                .map(|request| (line, request))
                .map_err(|reason| Error::InvalidRecord { line, reason }),
        )
    })
}
