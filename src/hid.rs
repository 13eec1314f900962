//! HID report models.
//!
//! A HID device's report descriptor is parsed by the OS into a set of button
//! and value capabilities per report kind. [`Report::build`] turns the
//! capability counts from [`HidCaps`] and the capabilities returned by a
//! [`CapabilityQuery`] into a flat item table and an owned report buffer.

use std::{
    fmt::{Debug, Display},
    ops::RangeInclusive,
};

use log::{debug, warn};

/// Report kind, as used by `HidP_GetButtonCaps` / `HidP_GetValueCaps`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Input,
    Output,
    Feature,
}

impl ReportKind {
    fn name(self) -> &'static str {
        match self {
            ReportKind::Input => "Input",
            ReportKind::Output => "Output",
            ReportKind::Feature => "Feature",
        }
    }
}

/// Top-level capabilities of a HID collection (`HIDP_CAPS`).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HidCaps {
    pub usage: u16,
    pub usage_page: u16,
    pub input_report_byte_length: u16,
    pub output_report_byte_length: u16,
    pub feature_report_byte_length: u16,
    pub num_link_collection_nodes: u16,
    pub num_input_button_caps: u16,
    pub num_input_value_caps: u16,
    pub num_input_data_indices: u16,
    pub num_output_button_caps: u16,
    pub num_output_value_caps: u16,
    pub num_output_data_indices: u16,
    pub num_feature_button_caps: u16,
    pub num_feature_value_caps: u16,
    pub num_feature_data_indices: u16,
}

impl HidCaps {
    /// Report byte length and declared button / value capability counts for `kind`.
    ///
    /// The byte length includes the report ID byte.
    pub fn report_layout(&self, kind: ReportKind) -> (usize, usize, usize) {
        let (len, buttons, values) = match kind {
            ReportKind::Input => (
                self.input_report_byte_length,
                self.num_input_button_caps,
                self.num_input_value_caps,
            ),
            ReportKind::Output => (
                self.output_report_byte_length,
                self.num_output_button_caps,
                self.num_output_value_caps,
            ),
            ReportKind::Feature => (
                self.feature_report_byte_length,
                self.num_feature_button_caps,
                self.num_feature_value_caps,
            ),
        };
        (len as usize, buttons as usize, values as usize)
    }
}

/// Fields shared by button and value capabilities.
///
/// When `is_range` is set, `usage..=usage_max` is the usage range; otherwise
/// `usage_max` is unused. The same holds for the string, designator and data
/// index pairs.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ItemCaps {
    pub report_id: u8,
    pub usage_page: u16,
    pub usage: u16,
    pub usage_max: u16,
    pub bit_field: u16,
    pub link_collection: u16,
    pub link_usage: u16,
    pub link_usage_page: u16,
    pub is_alias: bool,
    pub is_range: bool,
    pub is_string_range: bool,
    pub is_designator_range: bool,
    pub is_absolute: bool,
    pub string_index: u16,
    pub string_max: u16,
    pub designator_index: u16,
    pub designator_max: u16,
    pub data_index: u16,
    pub data_index_max: u16,
}

impl ItemCaps {
    /// Usages covered by this capability.
    pub fn usages(&self) -> RangeInclusive<u16> {
        if self.is_range && self.usage_max >= self.usage {
            self.usage..=self.usage_max
        } else {
            self.usage..=self.usage
        }
    }

    /// Number of usages covered by this capability.
    pub fn usage_count(&self) -> usize {
        let r = self.usages();
        (*r.end() - *r.start()) as usize + 1
    }
}

/// A value capability (`HIDP_VALUE_CAPS`).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ValueCap {
    pub item: ItemCaps,
    pub has_null: bool,
    pub bit_size: u16,
    pub report_count: u16,
    pub units: u32,
    pub units_exp: u32,
    pub logical_min: i32,
    pub logical_max: i32,
    pub physical_min: i32,
    pub physical_max: i32,
}

/// Source of button and value capabilities for one HID collection.
///
/// This is the pre-parsed report descriptor query the OS provides. Each
/// method fills `out` from the front and returns how many entries it wrote,
/// which may be fewer than `out.len()`.
pub trait CapabilityQuery {
    fn button_caps(&mut self, kind: ReportKind, out: &mut [ItemCaps]) -> usize;

    fn value_caps(&mut self, kind: ReportKind, out: &mut [ValueCap]) -> usize;

    /// Maximum number of usages that can be reported at once for a button
    /// usage page (`HidP_MaxUsageListLength`).
    fn max_usage_list_length(&mut self, kind: ReportKind, usage_page: u16) -> usize {
        let _ = (kind, usage_page);
        0
    }
}

/// One entry of a report's item table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HidItem {
    pub is_button: bool,
    pub report_id: u8,
    pub usage_page: u16,
    pub usage: u16,

    /// Last usage of a button range. Equal to `usage` for single usages and
    /// for every value item.
    pub usage_max: u16,

    /// Largest number of usages of this page that can be on at once. Zero
    /// for value items.
    pub max_usage_length: usize,
}

impl HidItem {
    /// Individual usages covered by this item.
    pub fn usages(&self) -> RangeInclusive<u16> {
        self.usage..=self.usage_max
    }
}

/// An Input, Output or Feature report with its capability tables.
pub struct Report {
    kind: ReportKind,
    report_id: u8,
    byte_len: usize,
    data: Vec<u8>,
    buttons: Vec<ItemCaps>,
    values: Vec<ValueCap>,
    items: Vec<HidItem>,
    num_values: usize,
}

impl Report {
    /// Build the report model for `kind`.
    ///
    /// The number of capabilities actually returned by `query` replaces the
    /// counts declared in `caps`. The report ID is that of the last
    /// capability processed, buttons first and then values.
    pub fn build(kind: ReportKind, caps: &HidCaps, query: &mut dyn CapabilityQuery) -> Report {
        let (byte_len, declared_buttons, declared_values) = caps.report_layout(kind);

        let buttons = query_caps(declared_buttons, |out| query.button_caps(kind, out));
        if buttons.len() != declared_buttons {
            debug!(
                "{} report: {} of {declared_buttons} button capabilities returned",
                kind.name(),
                buttons.len()
            );
        }

        let values = query_caps(declared_values, |out| query.value_caps(kind, out));
        if values.len() != declared_values {
            debug!(
                "{} report: {} of {declared_values} value capabilities returned",
                kind.name(),
                values.len()
            );
        }

        let mut report_id = 0;
        let mut items = Vec::with_capacity(buttons.len() + values.len());

        for b in &buttons {
            report_id = b.report_id;
            let range = b.usages();
            items.push(HidItem {
                is_button: true,
                report_id: b.report_id,
                usage_page: b.usage_page,
                usage: *range.start(),
                usage_max: *range.end(),
                max_usage_length: query.max_usage_list_length(kind, b.usage_page),
            });
        }

        for v in &values {
            report_id = v.item.report_id;
            // A ranged value keeps only its first usage in the item table.
            items.push(HidItem {
                is_button: false,
                report_id: v.item.report_id,
                usage_page: v.item.usage_page,
                usage: v.item.usage,
                usage_max: v.item.usage,
                max_usage_length: 0,
            });
        }

        if items.iter().any(|i| i.report_id != report_id) {
            warn!(
                "{} report: capabilities carry different report IDs, using {report_id}",
                kind.name()
            );
        }

        let num_values = values.iter().map(|v| v.item.usage_count()).sum();
        let data = if byte_len > 0 {
            vec![0; byte_len + 1]
        } else {
            Vec::new()
        };

        Report {
            kind,
            report_id,
            byte_len,
            data,
            buttons,
            values,
            items,
            num_values,
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn report_id(&self) -> u8 {
        self.report_id
    }

    /// Report length in bytes as declared by the device, including the
    /// report ID byte.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Report buffer: the report ID in byte 0 followed by the payload.
    ///
    /// Empty if the device declares no report of this kind.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the report buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Store `id` in the report ID byte of the buffer.
    ///
    /// Does nothing if the device declares no report of this kind.
    pub fn set_report_id(&mut self, id: u8) {
        if let Some(b) = self.data.first_mut() {
            *b = id;
        }
    }

    /// Button capabilities as returned by the query.
    ///
    /// A button usage range stays a single entry spanning
    /// `usage..=usage_max`; use [`ItemCaps::usages`] to expand it.
    pub fn buttons(&self) -> &[ItemCaps] {
        &self.buttons
    }

    pub fn values(&self) -> &[ValueCap] {
        &self.values
    }

    pub fn num_button_caps(&self) -> usize {
        self.buttons.len()
    }

    pub fn num_value_caps(&self) -> usize {
        self.values.len()
    }

    /// Number of value usages, counting each usage of a ranged value.
    pub fn num_values(&self) -> usize {
        self.num_values
    }

    /// `num_button_caps() + num_values()`.
    pub fn num_items(&self) -> usize {
        self.buttons.len() + self.num_values
    }

    /// Item table: one entry per button capability, then one per value
    /// capability.
    ///
    /// A ranged value is represented by its first usage only, so this can
    /// be shorter than [`num_items`][Self::num_items].
    pub fn items(&self) -> &[HidItem] {
        &self.items
    }
}

fn query_caps<T: Default + Clone>(
    declared: usize,
    query: impl FnOnce(&mut [T]) -> usize,
) -> Vec<T> {
    let mut out = vec![T::default(); declared];
    if declared == 0 {
        return out;
    }
    let n = query(&mut out);
    out.truncate(n.min(declared));
    out
}

impl Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report")
            .field("kind", &self.kind)
            .field("report_id", &self.report_id)
            .field("byte_len", &self.byte_len)
            .field("num_button_caps", &self.buttons.len())
            .field("num_value_caps", &self.values.len())
            .field("num_items", &self.num_items())
            .field("items", &self.items)
            .finish()
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} report {:#04x}: {} bytes, {} items",
            self.kind.name(),
            self.report_id,
            self.byte_len,
            self.num_items()
        )?;
        for b in &self.buttons {
            write!(f, "  button page {:#06x} usage ", b.usage_page)?;
            let r = b.usages();
            if b.is_range {
                writeln!(f, "{:#06x}..={:#06x}", r.start(), r.end())?;
            } else {
                writeln!(f, "{:#06x}", r.start())?;
            }
        }
        for v in &self.values {
            write!(f, "  value page {:#06x} usage {:#06x}", v.item.usage_page, v.item.usage)?;
            if v.item.is_range {
                write!(f, "..={:#06x}", v.item.usage_max)?;
            }
            writeln!(
                f,
                " bits {}x{} logical {}..={} physical {}..={}",
                v.bit_size,
                v.report_count,
                v.logical_min,
                v.logical_max,
                v.physical_min,
                v.physical_max
            )?;
        }
        Ok(())
    }
}

/// The three reports of a HID collection.
#[derive(Debug)]
pub struct HidReports {
    caps: HidCaps,
    input: Report,
    output: Report,
    feature: Report,
}

impl HidReports {
    pub fn build(caps: HidCaps, query: &mut dyn CapabilityQuery) -> HidReports {
        HidReports {
            input: Report::build(ReportKind::Input, &caps, query),
            output: Report::build(ReportKind::Output, &caps, query),
            feature: Report::build(ReportKind::Feature, &caps, query),
            caps,
        }
    }

    pub fn caps(&self) -> &HidCaps {
        &self.caps
    }

    pub fn usage(&self) -> u16 {
        self.caps.usage
    }

    pub fn usage_page(&self) -> u16 {
        self.caps.usage_page
    }

    pub fn report(&self, kind: ReportKind) -> &Report {
        match kind {
            ReportKind::Input => &self.input,
            ReportKind::Output => &self.output,
            ReportKind::Feature => &self.feature,
        }
    }

    pub fn report_mut(&mut self, kind: ReportKind) -> &mut Report {
        match kind {
            ReportKind::Input => &mut self.input,
            ReportKind::Output => &mut self.output,
            ReportKind::Feature => &mut self.feature,
        }
    }

    pub fn input(&self) -> &Report {
        &self.input
    }

    pub fn output(&self) -> &Report {
        &self.output
    }

    pub fn feature(&self) -> &Report {
        &self.feature
    }
}

impl Display for HidReports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "HID usage page {:#06x} usage {:#06x}",
            self.caps.usage_page, self.caps.usage
        )?;
        for r in [&self.feature, &self.input, &self.output] {
            if r.num_items() > 0 {
                Display::fmt(r, f)?;
            }
        }
        Ok(())
    }
}
