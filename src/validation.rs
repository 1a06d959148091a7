// 📐 Validation & normalization of student input
//
// Contact points are normalized BEFORE they are stored, so lookups
// (checkout email → person, sibling detection by shared phone) can compare
// plain strings.

use chrono::NaiveDate;

use crate::entities::Program;
use crate::error::AdminError;
use crate::students::NewStudent;

/// Oldest date of birth we accept, in years before today
const MAX_AGE_YEARS: u32 = 100;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: &str) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Collects every field error so the caller sees all of them at once
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the value on success, remember the error otherwise
    pub fn check<T>(&mut self, result: Result<T, ValidationError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn finish(self) -> Result<(), AdminError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AdminError::Validation(
                self.errors.iter().map(|e| e.to_string()).collect(),
            ))
        }
    }
}

// ============================================================================
// NORMALIZERS
// ============================================================================

/// Trim and collapse internal whitespace
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn require_name(field: &str, raw: &str) -> Result<String, ValidationError> {
    let name = normalize_name(raw);
    if name.is_empty() {
        return Err(ValidationError::new(field, "required"));
    }
    if name.chars().count() > 100 {
        return Err(ValidationError::new(field, "longer than 100 characters"));
    }
    Ok(name)
}

/// Legacy rows keep a single `name`; the last word becomes the last name
pub fn split_full_name(raw: &str) -> (String, String) {
    let name = normalize_name(raw);
    match name.rsplit_once(' ') {
        Some((first, last)) => (first.to_string(), last.to_string()),
        None => (name, String::new()),
    }
}

pub fn normalize_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim().to_lowercase();
    let mut parts = email.split('@');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        _ => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(ValidationError::new("email", "not a valid email address"))
    }
}

/// Keep digits only; an 11-digit number with a leading US country code loses it
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    };
    if digits.len() == 10 {
        Ok(digits)
    } else {
        Err(ValidationError::new("phone", "must contain 10 digits"))
    }
}

pub fn validate_date_of_birth(
    dob: NaiveDate,
    today: NaiveDate,
) -> Result<NaiveDate, ValidationError> {
    if dob > today {
        return Err(ValidationError::new("date_of_birth", "is in the future"));
    }
    match today.years_since(dob) {
        Some(age) if age <= MAX_AGE_YEARS => Ok(dob),
        _ => Err(ValidationError::new("date_of_birth", "is implausibly old")),
    }
}

pub fn validate_amount(field: &str, cents: i64) -> Result<i64, ValidationError> {
    if cents < 0 {
        Err(ValidationError::new(field, "must not be negative"))
    } else {
        Ok(cents)
    }
}

// ============================================================================
// NEW STUDENT
// ============================================================================

/// A `NewStudent` after normalization, every required field present
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStudent {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub program: Program,
    pub monthly_rate: i64,
}

fn optional_contact(
    v: &mut Validator,
    raw: Option<&str>,
    normalize: fn(&str) -> Result<String, ValidationError>,
) -> Option<String> {
    raw.filter(|s| !s.trim().is_empty())
        .and_then(|s| v.check(normalize(s)))
}

/// Check every field of a new student and report all problems together
pub fn validate_new_student(
    input: &NewStudent,
    today: NaiveDate,
) -> Result<ValidatedStudent, AdminError> {
    let mut v = Validator::new();
    let first_name = v.check(require_name("first_name", &input.first_name));
    let last_name = v.check(require_name("last_name", &input.last_name));
    let email = optional_contact(&mut v, input.email.as_deref(), normalize_email);
    let phone = optional_contact(&mut v, input.phone.as_deref(), normalize_phone);
    let date_of_birth = input
        .date_of_birth
        .and_then(|dob| v.check(validate_date_of_birth(dob, today)));
    let monthly_rate = v.check(validate_amount("monthly_rate", input.monthly_rate));
    let program = v.check(
        input
            .program
            .ok_or_else(|| ValidationError::new("program", "required")),
    );
    v.finish()?;

    match (first_name, last_name, program, monthly_rate) {
        (Some(first_name), Some(last_name), Some(program), Some(monthly_rate)) => {
            Ok(ValidatedStudent {
                first_name,
                last_name,
                email,
                phone,
                date_of_birth,
                program,
                monthly_rate,
            })
        }
        _ => Err(AdminError::validation("student: incomplete input")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Amina   Yusuf "), "Amina Yusuf");
        assert_eq!(normalize_name("   "), "");
        assert!(require_name("first_name", "  ").is_err());
        assert_eq!(require_name("first_name", " Ali ").unwrap(), "Ali");
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(
            split_full_name("Abdi Rahman  Warsame"),
            ("Abdi Rahman".to_string(), "Warsame".to_string())
        );
        assert_eq!(split_full_name("Hodan"), ("Hodan".to_string(), String::new()));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Parent@Example.COM ").unwrap(), "parent@example.com");
        assert!(normalize_email("no-at-sign.com").is_err());
        assert!(normalize_email("a@b@c.com").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("a@localhost").is_err());
        assert!(normalize_email("a b@example.com").is_err());
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("(612) 555-0147").unwrap(), "6125550147");
        assert_eq!(normalize_phone("+1 612 555 0147").unwrap(), "6125550147");
        assert!(normalize_phone("555-0147").is_err());
        assert!(normalize_phone("2 612 555 0147").is_err());
    }

    #[test]
    fn test_validate_date_of_birth() {
        let today = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        let dob = |y| NaiveDate::from_ymd_opt(y, 1, 1).unwrap();
        assert!(validate_date_of_birth(dob(2012), today).is_ok());
        assert!(validate_date_of_birth(dob(2026), today).is_err());
        assert!(validate_date_of_birth(dob(1900), today).is_err());
    }

    #[test]
    fn test_validate_new_student() {
        let today = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        let input = NewStudent {
            first_name: " Amina ".to_string(),
            last_name: "Yusuf".to_string(),
            email: Some("Amina@Example.com".to_string()),
            phone: Some("".to_string()),
            program: Some(Program::Dugsi),
            monthly_rate: 8000,
            ..Default::default()
        };
        let valid = validate_new_student(&input, today).unwrap();
        assert_eq!(valid.first_name, "Amina");
        assert_eq!(valid.email.as_deref(), Some("amina@example.com"));
        assert_eq!(valid.phone, None);

        let missing = NewStudent::default();
        match validate_new_student(&missing, today) {
            Err(AdminError::Validation(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors.iter().any(|e| e.starts_with("program")));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validator_collects_all_errors() {
        let mut v = Validator::new();
        assert_eq!(v.check(require_name("first_name", "Ali")), Some("Ali".to_string()));
        assert_eq!(v.check(normalize_email("bad")), None);
        assert_eq!(v.check(normalize_phone("123")), None);
        assert!(v.has_errors());

        match v.finish() {
            Err(AdminError::Validation(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("email"));
                assert!(errors[1].starts_with("phone"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
