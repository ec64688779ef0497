//! Rule-based field extraction for vehicle visit requests.
//!
//! Every field is recovered independently from `subject + "\n" + body`.
//! A field that cannot be found is simply `None`; deciding which absences
//! are fatal is left to the pipeline.

use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Structured fields recovered from one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractedRecord {
    pub vehicle: Option<String>,
    pub license_plate: Option<String>,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
    pub visit_date: Option<String>,
    pub visit_time_start: Option<String>,
    pub visit_time_end: Option<String>,
    pub visit_purpose: Option<String>,
}

/// A single way of recovering a field from the full message text.
type Strategy = fn(&str) -> Option<String>;

/// Purpose strategies, most specific first.
const PURPOSE_STRATEGIES: &[Strategy] = &[
    labelled_purpose,
    purpose_after_time_line,
    trailing_prose_line,
];

// Lazily compiled patterns, one per field.

static VEHICLE: OnceLock<Regex> = OnceLock::new();
static LICENSE_PLATE: OnceLock<Regex> = OnceLock::new();
static DRIVER_NAME: OnceLock<Regex> = OnceLock::new();
static DRIVER_PHONE: OnceLock<Regex> = OnceLock::new();
static VISIT_DATE: OnceLock<Regex> = OnceLock::new();
static TIME_RANGE: OnceLock<Regex> = OnceLock::new();
static PURPOSE_LABEL: OnceLock<Regex> = OnceLock::new();
static CLOCK_TIME: OnceLock<Regex> = OnceLock::new();
static CYRILLIC: OnceLock<Regex> = OnceLock::new();
static DIGIT_OR_CONTACT: OnceLock<Regex> = OnceLock::new();

fn vehicle_re() -> &'static Regex {
    VEHICLE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:Автомобиль|Марка(?:\s+ТС)?|Транспортное средство)[:\s]+([А-ЯЁа-яёa-zA-Z0-9\s\-]+?)(?:\n|—|–|$)",
        )
        .expect("Invalid regex")
    })
}

fn license_plate_re() -> &'static Regex {
    LICENSE_PLATE.get_or_init(|| {
        Regex::new(r"(?i)[А-ЯA-Z]\d{3}[А-ЯA-Z]{2}\d{2,3}").expect("Invalid regex")
    })
}

fn driver_name_re() -> &'static Regex {
    DRIVER_NAME.get_or_init(|| {
        Regex::new(
            r"(?i:Водитель|ФИО водителя)[:\s]*([А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+)",
        )
        .expect("Invalid regex")
    })
}

fn driver_phone_re() -> &'static Regex {
    DRIVER_PHONE.get_or_init(|| {
        Regex::new(
            r"\+7\s*\d{3}[-\s]?\d{3}[-\s]?\d{2}[-\s]?\d{2}|\+7\s*\(\d{3}\)\s*\d{3}-\d{2}-\d{2}",
        )
        .expect("Invalid regex")
    })
}

fn visit_date_re() -> &'static Regex {
    VISIT_DATE.get_or_init(|| Regex::new(r"\d{2}\.\d{2}\.\d{4}").expect("Invalid regex"))
}

fn time_range_re() -> &'static Regex {
    TIME_RANGE.get_or_init(|| {
        Regex::new(r"(?i)с\s*(\d{1,2}:\d{2})\s*до\s*(\d{1,2}:\d{2})").expect("Invalid regex")
    })
}

fn purpose_label_re() -> &'static Regex {
    PURPOSE_LABEL.get_or_init(|| {
        Regex::new(r"(?i)(?:Цель визита|Цель:|Цель заезда|Причина:)[:\s]*(.+?)(?:\n|$)")
            .expect("Invalid regex")
    })
}

fn clock_time_re() -> &'static Regex {
    CLOCK_TIME.get_or_init(|| Regex::new(r"\d{2}:\d{2}").expect("Invalid regex"))
}

fn cyrillic_re() -> &'static Regex {
    CYRILLIC.get_or_init(|| Regex::new(r"[А-Яа-яЁё]").expect("Invalid regex"))
}

fn digit_or_contact_re() -> &'static Regex {
    DIGIT_OR_CONTACT.get_or_init(|| Regex::new(r"[\d@+]").expect("Invalid regex"))
}

/// Extract every known field from a message body and subject.
///
/// Never fails: unrecognised fields are left as `None`. The same input always
/// yields the same record.
pub fn extract(body: &str, subject: &str) -> ExtractedRecord {
    let text = format!("{}\n{}", subject, body).replace("\r\n", "\n");
    let text = text.trim();

    let (visit_time_start, visit_time_end) = match time_range(text) {
        Some((start, end)) => (Some(start), Some(end)),
        None => (None, None),
    };

    let record = ExtractedRecord {
        vehicle: vehicle(text),
        license_plate: license_plate(text),
        driver_name: driver_name(text),
        driver_phone: driver_phone(text),
        visit_date: visit_date(text),
        visit_time_start,
        visit_time_end,
        visit_purpose: first_match(text, PURPOSE_STRATEGIES)
            .map(|p| p.trim_end_matches('.').to_string()),
    };

    if record.license_plate.is_none() {
        warn!("[extract] license plate not found");
    }
    if record.visit_date.is_none() {
        warn!("[extract] visit date not found");
    }
    if record.visit_time_start.is_none() || record.visit_time_end.is_none() {
        warn!("[extract] full visit time window not found");
    }
    debug!("[extract] extracted record: {:?}", record);

    record
}

fn first_match(text: &str, strategies: &[Strategy]) -> Option<String> {
    strategies.iter().find_map(|strategy| strategy(text))
}

fn vehicle(text: &str) -> Option<String> {
    vehicle_re()
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|v| !v.is_empty())
}

fn license_plate(text: &str) -> Option<String> {
    license_plate_re()
        .find(text)
        .map(|m| m.as_str().to_uppercase())
}

fn driver_name(text: &str) -> Option<String> {
    driver_name_re()
        .captures(text)
        .map(|caps| caps[1].split_whitespace().collect::<Vec<_>>().join(" "))
}

fn driver_phone(text: &str) -> Option<String> {
    driver_phone_re().find(text).map(|m| {
        m.as_str()
            .chars()
            .filter(|c| *c == '+' || c.is_ascii_digit())
            .collect()
    })
}

fn visit_date(text: &str) -> Option<String> {
    visit_date_re().find(text).map(|m| m.as_str().to_string())
}

fn time_range(text: &str) -> Option<(String, String)> {
    time_range_re()
        .captures(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

fn labelled_purpose(text: &str) -> Option<String> {
    purpose_label_re()
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|p| !p.is_empty())
}

/// The line right after the first line holding a clock time, when it reads
/// like prose.
fn purpose_after_time_line(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    for (i, line) in lines.iter().enumerate() {
        if !clock_time_re().is_match(line) {
            continue;
        }
        let Some(next) = lines.get(i + 1).map(|l| l.trim()) else {
            continue;
        };
        if next.is_empty() || !cyrillic_re().is_match(next) {
            continue;
        }
        if next.chars().count() > 10 {
            return Some(next.to_string());
        }
    }
    None
}

/// The last reasonably long line without digits or contact details.
fn trailing_prose_line(text: &str) -> Option<String> {
    text.split('\n')
        .rev()
        .map(str::trim)
        .find(|line| line.chars().count() > 15 && !digit_or_contact_re().is_match(line))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Автомобиль: Toyota Camry\nВодитель: Иванов Петр Сергеевич\n+7 912 345 67 89\nа123вс77\n05.12.2025\nс 09:00 до 17:00\nЦель визита: Доставка груза";

    #[test]
    fn full_sample_extracts_every_field() {
        let record = extract(SAMPLE, "");
        assert_eq!(
            record,
            ExtractedRecord {
                vehicle: Some("Toyota Camry".to_string()),
                license_plate: Some("А123ВС77".to_string()),
                driver_name: Some("Иванов Петр Сергеевич".to_string()),
                driver_phone: Some("+79123456789".to_string()),
                visit_date: Some("05.12.2025".to_string()),
                visit_time_start: Some("09:00".to_string()),
                visit_time_end: Some("17:00".to_string()),
                visit_purpose: Some("Доставка груза".to_string()),
            }
        );
    }

    #[test]
    fn empty_text_yields_empty_record() {
        assert_eq!(extract("", ""), ExtractedRecord::default());
    }

    #[test]
    fn unlabelled_text_yields_no_labelled_fields() {
        let record = extract("Добрый день, спасибо", "Привет");
        assert!(record.vehicle.is_none());
        assert!(record.license_plate.is_none());
        assert!(record.driver_name.is_none());
        assert!(record.driver_phone.is_none());
        assert!(record.visit_date.is_none());
    }

    #[test]
    fn plate_is_upper_cased_and_found_without_label() {
        let record = extract("приедет машина х777мм799 завтра", "");
        assert_eq!(record.license_plate.as_deref(), Some("Х777ММ799"));
    }

    #[test]
    fn plate_accepts_latin_letters() {
        let record = extract("plate a123bc77", "");
        assert_eq!(record.license_plate.as_deref(), Some("A123BC77"));
    }

    #[test]
    fn plate_in_subject_is_found() {
        let record = extract("Прошу пропуск", "Пропуск В456ОР150");
        assert_eq!(record.license_plate.as_deref(), Some("В456ОР150"));
    }

    #[test]
    fn parenthesized_phone_is_stripped() {
        let record = extract("Телефон: +7 (912) 345-67-89", "");
        assert_eq!(record.driver_phone.as_deref(), Some("+79123456789"));
    }

    #[test]
    fn hyphenated_phone_is_stripped() {
        let record = extract("тел +7 912-345-67-89", "");
        assert_eq!(record.driver_phone.as_deref(), Some("+79123456789"));
    }

    #[test]
    fn driver_name_requires_three_capitalized_words() {
        assert!(extract("Водитель: Иванов Петр", "").driver_name.is_none());
        assert!(extract("Иванов Петр Сергеевич", "").driver_name.is_none());
    }

    #[test]
    fn driver_name_accepts_full_label() {
        let record = extract("ФИО водителя: Смирнова Анна Ивановна", "");
        assert_eq!(record.driver_name.as_deref(), Some("Смирнова Анна Ивановна"));
    }

    #[test]
    fn vehicle_stops_at_dash() {
        let record = extract("Марка ТС: КАМАЗ 65115 — самосвал", "");
        assert_eq!(record.vehicle.as_deref(), Some("КАМАЗ 65115"));
    }

    #[test]
    fn vehicle_stops_at_en_dash() {
        let record = extract("Автомобиль: ГАЗель Next – фургон", "");
        assert_eq!(record.vehicle.as_deref(), Some("ГАЗель Next"));
    }

    #[test]
    fn single_time_is_not_a_window() {
        let record = extract("Приезд в 09:00", "");
        assert!(record.visit_time_start.is_none());
        assert!(record.visit_time_end.is_none());
    }

    #[test]
    fn time_window_accepts_single_digit_hour() {
        let record = extract("С 9:30 до 18:00", "");
        assert_eq!(record.visit_time_start.as_deref(), Some("9:30"));
        assert_eq!(record.visit_time_end.as_deref(), Some("18:00"));
    }

    #[test]
    fn date_is_kept_as_written() {
        let record = extract("Дата: 01.02.2026.", "");
        assert_eq!(record.visit_date.as_deref(), Some("01.02.2026"));
    }

    #[test]
    fn purpose_label_strips_trailing_period() {
        let record = extract("Причина: вывоз мусора.", "");
        assert_eq!(record.visit_purpose.as_deref(), Some("вывоз мусора"));
    }

    #[test]
    fn purpose_short_label() {
        let record = extract("Цель: Вывоз тары", "");
        assert_eq!(record.visit_purpose.as_deref(), Some("Вывоз тары"));
    }

    #[test]
    fn purpose_arrival_label() {
        let record = extract("Цель заезда: погрузка продукции", "");
        assert_eq!(record.visit_purpose.as_deref(), Some("погрузка продукции"));
    }

    #[test]
    fn purpose_falls_back_to_line_after_time() {
        let text = "а123вс77\n05.12.2025 с 09:00 до 17:00\nДоставка оборудования на склад.\nСпасибо";
        let record = extract(text, "");
        assert_eq!(record.visit_purpose.as_deref(), Some("Доставка оборудования на склад"));
    }

    #[test]
    fn purpose_after_time_skips_short_lines() {
        // "Монтаж" is too short, so the trailing prose line wins.
        let text = "с 09:00 до 17:00\nМонтаж\nПодключение вентиляции в цехе";
        let record = extract(text, "");
        assert_eq!(record.visit_purpose.as_deref(), Some("Подключение вентиляции в цехе"));
    }

    #[test]
    fn purpose_after_time_needs_cyrillic() {
        let text = "с 09:00 до 17:00\nDelivery of spare parts\nПриемка запчастей на склад";
        let record = extract(text, "");
        assert_eq!(record.visit_purpose.as_deref(), Some("Приемка запчастей на склад"));
    }

    #[test]
    fn trailing_prose_skips_lines_with_plus() {
        let text = "Пропуск для бригады монтажников\nКонтакт: +диспетчер смены";
        let record = extract(text, "");
        assert_eq!(record.visit_purpose.as_deref(), Some("Пропуск для бригады монтажников"));
    }

    #[test]
    fn purpose_falls_back_to_last_prose_line() {
        let text = "а123вс77 05.12.2025\nзабрать образцы продукции\nи@mail.ru\n+7 912 345 67 89";
        let record = extract(text, "");
        assert_eq!(record.visit_purpose.as_deref(), Some("забрать образцы продукции"));
    }

    #[test]
    fn crlf_bodies_are_handled() {
        let body = SAMPLE.replace('\n', "\r\n");
        assert_eq!(extract(&body, ""), extract(SAMPLE, ""));
    }

    #[test]
    fn extraction_is_deterministic() {
        assert_eq!(extract(SAMPLE, "Заявка"), extract(SAMPLE, "Заявка"));
    }
}
