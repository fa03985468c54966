use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::PackageError;

pub(crate) fn local_name(name: &[u8]) -> &[u8] {
    name.rsplit(|&b| b == b':').next().unwrap_or(name)
}

/// `local` with the namespace prefix of `container_name` (if any).
pub(crate) fn prefixed_tag(container_name: &[u8], local: &str) -> String {
    match container_name.iter().position(|&b| b == b':') {
        Some(idx) => {
            let prefix = std::str::from_utf8(&container_name[..idx]).unwrap_or_default();
            format!("{prefix}:{local}")
        }
        None => local.to_string(),
    }
}

pub(crate) fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>, PackageError> {
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        if local_name(attr.key.as_ref()).eq_ignore_ascii_case(local) {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)
}

/// Parse `bytes` as a standalone XML document.
pub fn check_well_formed(bytes: &[u8]) -> Result<(), PackageError> {
    let text = std::str::from_utf8(strip_bom(bytes)).map_err(|_| PackageError::NotUtf8)?;
    roxmltree::Document::parse(text)?;
    Ok(())
}

pub(crate) fn with_document<T>(
    bytes: &[u8],
    f: impl FnOnce(&roxmltree::Document<'_>) -> T,
) -> Result<T, PackageError> {
    let text = std::str::from_utf8(strip_bom(bytes)).map_err(|_| PackageError::NotUtf8)?;
    let doc = roxmltree::Document::parse(text)?;
    Ok(f(&doc))
}

/// Drop every element whose local name is in `local_names`, together with its subtree.
///
/// Returns the rewritten document and the number of elements removed.
pub(crate) fn remove_elements(
    xml: &[u8],
    local_names: &[&str],
) -> Result<(Vec<u8>, usize), PackageError> {
    let wanted = |e: &BytesStart<'_>| {
        let name = e.name();
        let local = local_name(name.as_ref());
        local_names.iter().any(|n| n.as_bytes() == local)
    };

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut buf = Vec::new();
    let mut skip_depth = 0usize;
    let mut removed = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(_) if skip_depth > 0 => skip_depth += 1,
            Event::End(_) if skip_depth > 0 => skip_depth -= 1,
            _ if skip_depth > 0 => {}
            Event::Start(ref e) if wanted(e) => {
                skip_depth = 1;
                removed += 1;
            }
            Event::Empty(ref e) if wanted(e) => removed += 1,
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    Ok((writer.into_inner(), removed))
}

/// A direct child of the document root that must exist, optionally with fixed attribute values.
pub(crate) struct RootChild<'a> {
    pub local: &'a str,
    pub attrs: &'a [(&'a str, &'a str)],
    /// Siblings that may precede the child; it is inserted before the first root child not
    /// listed here.
    pub after: &'a [&'a str],
    /// Rewrite `attrs` on an existing element instead of leaving it alone.
    pub patch_existing: bool,
}

impl RootChild<'_> {
    fn build(&self, root_name: &[u8]) -> BytesStart<'static> {
        let mut el = BytesStart::new(prefixed_tag(root_name, self.local));
        for &(key, value) in self.attrs {
            el.push_attribute((key, value));
        }
        el
    }

    /// `e` with `attrs` applied, or `None` when every value already matches.
    fn patch(&self, e: &BytesStart<'_>) -> Result<Option<BytesStart<'static>>, PackageError> {
        let mut patched = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
        let mut changed = false;
        let mut seen = Vec::with_capacity(self.attrs.len());
        for attr in e.attributes().with_checks(false) {
            let attr = attr?;
            let wanted = self
                .attrs
                .iter()
                .find(|(key, _)| key.as_bytes() == attr.key.as_ref());
            match wanted {
                Some(&(key, value)) => {
                    seen.push(key);
                    changed |= attr.value.as_ref() != value.as_bytes();
                    patched.push_attribute((key, value));
                }
                None => patched.push_attribute((attr.key.as_ref(), attr.value.as_ref())),
            }
        }
        for &(key, value) in self.attrs {
            if !seen.contains(&key) {
                changed = true;
                patched.push_attribute((key, value));
            }
        }
        Ok(changed.then_some(patched))
    }
}

/// Make sure the root element has a `child.local` child; see [`RootChild`].
pub(crate) fn upsert_root_child(
    xml: &[u8],
    child: &RootChild<'_>,
) -> Result<Option<Vec<u8>>, PackageError> {
    let exists = with_document(xml, |doc| {
        doc.root_element()
            .children()
            .any(|n| n.is_element() && n.tag_name().name() == child.local)
    })?;
    if exists && !child.patch_existing {
        return Ok(None);
    }

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 128));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut root_name = Vec::new();
    let mut inserted = exists;
    let mut changed = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if depth == 0 => {
                root_name = e.name().as_ref().to_vec();
                depth = 1;
                writer.write_event(event.borrow())?;
            }
            Event::Empty(ref e) if depth == 0 => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer.write_event(Event::Start(e.borrow()))?;
                writer.write_event(Event::Empty(child.build(name.as_bytes())))?;
                writer.write_event(Event::End(BytesEnd::new(name)))?;
                inserted = true;
                changed = true;
            }
            Event::Start(ref e) | Event::Empty(ref e) if depth == 1 => {
                let is_start = matches!(event, Event::Start(_));
                let name = e.name();
                let local = local_name(name.as_ref());
                if !inserted && !child.after.iter().any(|a| a.as_bytes() == local) {
                    writer.write_event(Event::Empty(child.build(&root_name)))?;
                    inserted = true;
                    changed = true;
                }
                let patched = if local == child.local.as_bytes() && child.patch_existing {
                    child.patch(e)?
                } else {
                    None
                };
                match patched {
                    Some(patched) => {
                        changed = true;
                        writer.write_event(if is_start {
                            Event::Start(patched)
                        } else {
                            Event::Empty(patched)
                        })?;
                    }
                    None => writer.write_event(event.borrow())?,
                }
                if is_start {
                    depth += 1;
                }
            }
            Event::Start(_) => {
                depth += 1;
                writer.write_event(event.borrow())?;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 && !inserted {
                    writer.write_event(Event::Empty(child.build(&root_name)))?;
                    inserted = true;
                    changed = true;
                }
                writer.write_event(event.borrow())?;
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    Ok(changed.then(|| writer.into_inner()))
}
