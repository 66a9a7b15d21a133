use std::convert::TryInto;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::record::{rotated_cmp, Code, Record};
use crate::{DATA_SIZE, RECORD_SIZE};

/// Read fixed-width items until EOF or `limit`, skipping `stride - 1` items
/// after every item kept. A trailing partial item is an error.
fn read_fixed_from_reader<R, T, F>(
    mut reader: R,
    width: usize,
    stride: usize,
    limit: Option<usize>,
    convert: F,
) -> io::Result<Vec<T>>
where
    R: Read,
    F: Fn(&[u8]) -> T,
{
    let mut items = Vec::new();
    let mut buffer = vec![0u8; width];
    let mut index = 0usize;

    loop {
        if let Some(max) = limit {
            if items.len() >= max {
                break;
            }
        }

        let mut filled = 0usize;
        while filled < width {
            match reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        if filled == 0 {
            break;
        }
        if filled < width {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("item {index} is truncated: {filled} of {width} bytes"),
            ));
        }

        if index % stride == 0 {
            items.push(convert(&buffer));
        }
        index += 1;
    }

    Ok(items)
}

fn code_from(bytes: &[u8]) -> Code {
    bytes.try_into().expect("slice of code length")
}

pub fn read_records_from_reader<R: Read>(
    reader: R,
    limit: Option<usize>,
) -> io::Result<Vec<Record>> {
    read_fixed_from_reader(reader, RECORD_SIZE, 1, limit, Record::from_bytes)
}

pub fn read_records<P: AsRef<Path>>(path: P, limit: Option<usize>) -> io::Result<Vec<Record>> {
    let file = File::open(path)?;
    read_records_from_reader(BufReader::new(file), limit)
}

/// Read a query file: bare codes back to back.
pub fn read_codes_from_reader<R: Read>(reader: R, limit: Option<usize>) -> io::Result<Vec<Code>> {
    read_fixed_from_reader(reader, DATA_SIZE, 1, limit, code_from)
}

pub fn read_codes<P: AsRef<Path>>(path: P, limit: Option<usize>) -> io::Result<Vec<Code>> {
    let file = File::open(path)?;
    read_codes_from_reader(BufReader::new(file), limit)
}

/// Codes of records `0, rate, 2 * rate, ...` of a record stream.
pub fn sample_codes_from_reader<R: Read>(reader: R, rate: usize) -> io::Result<Vec<Code>> {
    if rate == 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "sample rate must be positive",
        ));
    }
    read_fixed_from_reader(reader, RECORD_SIZE, rate, None, |bytes| {
        code_from(&bytes[..DATA_SIZE])
    })
}

pub fn sample_codes<P: AsRef<Path>>(path: P, rate: usize) -> io::Result<Vec<Code>> {
    let file = File::open(path)?;
    sample_codes_from_reader(BufReader::new(file), rate)
}

pub fn write_records_to_writer<W: Write>(writer: W, records: &[Record]) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    for record in records {
        writer.write_all(&record.to_bytes())?;
    }
    writer.flush()
}

pub fn write_records<P: AsRef<Path>>(path: P, records: &[Record]) -> io::Result<()> {
    let file = File::create(path)?;
    write_records_to_writer(file, records)
}

pub fn write_codes_to_writer<W: Write>(writer: W, codes: &[Code]) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    for code in codes {
        writer.write_all(code)?;
    }
    writer.flush()
}

pub fn write_codes<P: AsRef<Path>>(path: P, codes: &[Code]) -> io::Result<()> {
    let file = File::create(path)?;
    write_codes_to_writer(file, codes)
}

/// Positions `i` of a record stream (every `rate`-th record) whose code sorts
/// before its predecessor when read from bit `first`.
pub fn find_unsorted_from_reader<R: Read>(
    reader: R,
    first: u32,
    rate: usize,
) -> io::Result<Vec<usize>> {
    let codes = sample_codes_from_reader(reader, rate)?;
    Ok(codes
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| rotated_cmp(&pair[0], &pair[1], first).is_gt())
        .map(|(idx, _)| idx + 1)
        .collect())
}

pub fn find_unsorted<P: AsRef<Path>>(path: P, first: u32, rate: usize) -> io::Result<Vec<usize>> {
    let file = File::open(path)?;
    find_unsorted_from_reader(BufReader::new(file), first, rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_records(n: usize, seed: u64) -> Vec<Record> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|i| Record::new(rng.gen(), i as u32)).collect()
    }

    #[test]
    fn records_survive_a_write_and_read() {
        let records = random_records(37, 1);
        let mut buffer = Vec::new();
        write_records_to_writer(&mut buffer, &records).unwrap();
        assert_eq!(buffer.len(), 37 * RECORD_SIZE);
        assert_eq!(read_records_from_reader(buffer.as_slice(), None).unwrap(), records);
        assert_eq!(
            read_records_from_reader(buffer.as_slice(), Some(5)).unwrap(),
            records[..5]
        );
    }

    #[test]
    fn truncated_record_is_invalid_data() {
        let records = random_records(3, 2);
        let mut buffer = Vec::new();
        write_records_to_writer(&mut buffer, &records).unwrap();
        buffer.pop();
        let err = read_records_from_reader(buffer.as_slice(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn sampling_keeps_every_rate_th_code() {
        let records = random_records(23, 3);
        let mut buffer = Vec::new();
        write_records_to_writer(&mut buffer, &records).unwrap();
        let sampled = sample_codes_from_reader(buffer.as_slice(), 5).unwrap();
        let expected: Vec<Code> = records.iter().step_by(5).map(|r| r.code).collect();
        assert_eq!(sampled, expected);
        assert_eq!(sampled.len(), 5);
        assert!(sample_codes_from_reader(buffer.as_slice(), 0).is_err());
    }

    #[test]
    fn unsorted_positions_are_reported() {
        let first = 72;
        let mut records = random_records(40, 4);
        records.sort_by(|a, b| rotated_cmp(&a.code, &b.code, first));
        let mut buffer = Vec::new();
        write_records_to_writer(&mut buffer, &records).unwrap();
        assert!(find_unsorted_from_reader(buffer.as_slice(), first, 1)
            .unwrap()
            .is_empty());

        records.swap(10, 11);
        buffer.clear();
        write_records_to_writer(&mut buffer, &records).unwrap();
        assert_eq!(
            find_unsorted_from_reader(buffer.as_slice(), first, 1).unwrap(),
            vec![11]
        );
    }

    #[test]
    fn query_codes_roundtrip() {
        let mut rng = StdRng::seed_from_u64(5);
        let codes: Vec<Code> = (0..9).map(|_| rng.gen()).collect();
        let mut buffer = Vec::new();
        write_codes_to_writer(&mut buffer, &codes).unwrap();
        assert_eq!(read_codes_from_reader(buffer.as_slice(), None).unwrap(), codes);
    }
}
