//! Composes the text the provider speaks to the dispatcher.

use callbridge_types::EmergencyReport;

/// Builds the natural-language briefing for a report.
///
/// The briefing is spoken at the start of the call, so it leads with the
/// service and the location and states plainly that the reporter cannot
/// speak.
pub fn build_briefing(report: &EmergencyReport) -> String {
    let mut briefing = format!(
        "This is an automated emergency call placed on behalf of a person who cannot speak. \
         They need {}.",
        report.service_needed.spoken()
    );

    briefing.push_str(&format!(
        " They describe the emergency as follows: {}",
        ensure_terminated(report.description.trim())
    ));

    match (report.address(), report.location.as_ref()) {
        (Some(address), Some(loc)) => {
            briefing.push_str(&format!(
                " The address given is {}. The device reports coordinates {}.",
                address,
                coordinates(loc)
            ));
        }
        (Some(address), None) => {
            briefing.push_str(&format!(" The address given is {}.", address));
        }
        (None, Some(loc)) => {
            briefing.push_str(&format!(
                " The device reports coordinates {}.",
                coordinates(loc)
            ));
        }
        // Validation rejects reports with neither.
        (None, None) => {}
    }

    briefing.push_str(&format!(
        " Their preferred language is {}. The report was filed at {} UTC.",
        report.browser_language.trim(),
        report.timestamp.format("%H:%M on %Y-%m-%d")
    ));
    briefing.push_str(
        " You can ask questions. The person will read your answers and reply by text, \
         which will be read out to you.",
    );
    briefing
}

fn coordinates(loc: &callbridge_types::GeoLocation) -> String {
    let mut text = format!(
        "latitude {:.5}, longitude {:.5}",
        loc.latitude, loc.longitude
    );
    if let Some(accuracy) = loc.accuracy {
        text.push_str(&format!(", accurate to about {:.0} meters", accuracy));
    }
    text
}

fn ensure_terminated(text: &str) -> String {
    if text.ends_with(['.', '!', '?']) {
        text.to_string()
    } else {
        format!("{}.", text)
    }
}
