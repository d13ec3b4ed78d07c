//! Area detector file writers: HDF5 (`AD_HDF5`, `AD_HDF5_SWMR`) and TIFF
//! series (`AD_TIFF`). Both can report their files; neither can be filled.

use std::path::PathBuf;

use serde_json::Value;

use super::{int_kwarg, Handler, HandlerError};

/// Every datum lives in one HDF5 file, `root/resource_path`.
pub struct AreaDetectorHdf5Handler {
    path: PathBuf,
}

impl AreaDetectorHdf5Handler {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Handler for AreaDetectorHdf5Handler {
    fn file_list(&self, _datum_kwargs: &[Value]) -> Result<Vec<PathBuf>, HandlerError> {
        Ok(vec![self.path.clone()])
    }

    fn fill(&self, _datum_kwargs: &Value) -> Result<Value, HandlerError> {
        Err(HandlerError::FillUnsupported("HDF5"))
    }
}

const TIFF_SPEC: &str = "AD_TIFF";

/// One TIFF file per frame, named by a printf-style template applied to
/// `(directory, filename, frame index)`.
pub struct AreaDetectorTiffHandler {
    directory: String,
    template: String,
    filename: String,
    frame_per_point: i64,
}

impl AreaDetectorTiffHandler {
    pub fn new(path: PathBuf, resource_kwargs: &Value) -> Result<Self, HandlerError> {
        let kwarg = |key: &'static str| {
            resource_kwargs
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(HandlerError::MissingKwarg {
                    spec: TIFF_SPEC,
                    key,
                })
        };
        let frame_per_point = match resource_kwargs.get("frame_per_point") {
            None | Some(Value::Null) => 1,
            Some(_) => int_kwarg(resource_kwargs, TIFF_SPEC, "frame_per_point")?,
        };
        if frame_per_point < 0 {
            return Err(HandlerError::KwargRange {
                spec: TIFF_SPEC,
                key: "frame_per_point",
                value: frame_per_point,
            });
        }

        let mut directory = path.to_string_lossy().into_owned();
        if !directory.ends_with('/') {
            directory.push('/');
        }

        Ok(Self {
            directory,
            template: kwarg("template")?,
            filename: kwarg("filename")?,
            frame_per_point,
        })
    }

    fn files_for_point(&self, point_number: i64) -> Result<Vec<PathBuf>, HandlerError> {
        let out_of_range = || HandlerError::KwargRange {
            spec: TIFF_SPEC,
            key: "point_number",
            value: point_number,
        };
        if point_number < 0 {
            return Err(out_of_range());
        }
        let start = point_number
            .checked_mul(self.frame_per_point)
            .ok_or_else(out_of_range)?;
        let end = start
            .checked_add(self.frame_per_point)
            .ok_or_else(out_of_range)?;
        (start..end)
            .map(|index| {
                let args = [
                    Arg::Str(&self.directory),
                    Arg::Str(&self.filename),
                    Arg::Int(index),
                ];
                printf(&self.template, &args).map(PathBuf::from)
            })
            .collect()
    }
}

impl Handler for AreaDetectorTiffHandler {
    fn file_list(&self, datum_kwargs: &[Value]) -> Result<Vec<PathBuf>, HandlerError> {
        let mut files = Vec::new();
        for kwargs in datum_kwargs {
            let point_number = int_kwarg(kwargs, TIFF_SPEC, "point_number")?;
            files.extend(self.files_for_point(point_number)?);
        }
        Ok(files)
    }

    fn fill(&self, _datum_kwargs: &Value) -> Result<Value, HandlerError> {
        Err(HandlerError::FillUnsupported("TIFF"))
    }
}

#[derive(Debug, Clone, Copy)]
enum Arg<'a> {
    Str(&'a str),
    Int(i64),
}

/// Minimal printf: `%s` and `%d` with `-`/`0` flags, width and precision,
/// plus `%%`. Arguments are consumed in order.
fn printf(template: &str, args: &[Arg<'_>]) -> Result<String, HandlerError> {
    let invalid = |reason: &str| HandlerError::Template {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut left_align = false;
        let mut zero_pad = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left_align = true,
                '0' => zero_pad = true,
                _ => break,
            }
            chars.next();
        }

        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }

        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }

        let body = match chars.next() {
            Some('%') => {
                out.push('%');
                continue;
            }
            Some('s') => match args.next() {
                Some(Arg::Str(s)) => match precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s.to_string(),
                },
                Some(Arg::Int(i)) => i.to_string(),
                None => return Err(invalid("not enough arguments")),
            },
            Some('d') | Some('i') => match args.next() {
                Some(Arg::Int(i)) => {
                    let digits = i.unsigned_abs().to_string();
                    let digits = format!("{:0>1$}", digits, precision.unwrap_or(1));
                    if *i < 0 {
                        format!("-{}", digits)
                    } else {
                        digits
                    }
                }
                Some(Arg::Str(_)) => return Err(invalid("%d applied to a string")),
                None => return Err(invalid("not enough arguments")),
            },
            Some(other) => return Err(invalid(&format!("unsupported conversion %{}", other))),
            None => return Err(invalid("dangling %")),
        };

        let pad = width.saturating_sub(body.chars().count());
        if left_align {
            out.push_str(&body);
            out.extend(std::iter::repeat(' ').take(pad));
        } else if zero_pad && precision.is_none() && !body.is_empty() {
            let (sign, digits) = match body.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("", body.as_str()),
            };
            out.push_str(sign);
            out.extend(std::iter::repeat('0').take(pad));
            out.push_str(digits);
        } else {
            out.extend(std::iter::repeat(' ').take(pad));
            out.push_str(&body);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_printf() {
        let args = [Arg::Str("/data/"), Arg::Str("img"), Arg::Int(7)];
        assert_eq!(printf("%s%s_%6.6d.tif", &args).unwrap(), "/data/img_000007.tif");
        assert_eq!(printf("%s%s_%d.tif", &args).unwrap(), "/data/img_7.tif");
        assert_eq!(printf("%s%s_%05d.tif", &args).unwrap(), "/data/img_00007.tif");
        assert_eq!(printf("%s%s_%3d%%", &args).unwrap(), "/data/img_  7%");
        assert!(printf("%s%s_%d_%d", &args).is_err());
        assert!(printf("%s%s_%x", &args).is_err());
    }

    #[test]
    fn test_tiff_file_list() {
        let kwargs = json!({
            "template": "%s%s_%6.6d.tiff",
            "filename": "frame",
            "frame_per_point": 2,
        });
        let handler = AreaDetectorTiffHandler::new(PathBuf::from("/data/tiff"), &kwargs).unwrap();
        let files = handler
            .file_list(&[json!({"point_number": 0}), json!({"point_number": 1})])
            .unwrap();
        let expected: Vec<PathBuf> = (0..4)
            .map(|i| PathBuf::from(format!("/data/tiff/frame_{:06}.tiff", i)))
            .collect();
        assert_eq!(files, expected);
        assert!(matches!(
            handler.fill(&json!({"point_number": 0})),
            Err(HandlerError::FillUnsupported(_))
        ));
    }

    #[test]
    fn test_tiff_point_number_out_of_range() {
        let kwargs = json!({
            "template": "%s%s_%d.tiff",
            "filename": "frame",
            "frame_per_point": 4,
        });
        let handler = AreaDetectorTiffHandler::new(PathBuf::from("/data"), &kwargs).unwrap();
        for point_number in [i64::MAX, i64::MAX / 4, -1] {
            let err = handler
                .file_list(&[json!({ "point_number": point_number })])
                .unwrap_err();
            assert!(matches!(
                err,
                HandlerError::KwargRange { key: "point_number", value, .. } if value == point_number
            ));
        }

        let kwargs = json!({"template": "%s%s_%d.tiff", "filename": "frame", "frame_per_point": -2});
        assert!(matches!(
            AreaDetectorTiffHandler::new(PathBuf::from("/data"), &kwargs),
            Err(HandlerError::KwargRange { key: "frame_per_point", .. })
        ));
    }

    #[test]
    fn test_tiff_requires_template() {
        let err = AreaDetectorTiffHandler::new(PathBuf::from("/d"), &json!({"filename": "f"}))
            .err()
            .unwrap();
        assert!(matches!(err, HandlerError::MissingKwarg { key: "template", .. }));
    }

    #[test]
    fn test_hdf5_single_file() {
        let handler = AreaDetectorHdf5Handler::new(PathBuf::from("/data/scan.h5"));
        let files = handler
            .file_list(&[json!({"point_number": 0}), json!({"point_number": 1})])
            .unwrap();
        assert_eq!(files, vec![PathBuf::from("/data/scan.h5")]);
        assert!(handler.fill(&json!({})).is_err());
    }
}
