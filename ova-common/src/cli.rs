// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Help and error colors shared by the agent binaries.
pub fn get_styles() -> clap::builder::Styles {
    let yellow = anstyle::Color::Rgb(anstyle::RgbColor(245, 207, 101));
    let green = anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151));
    let red = anstyle::Color::Rgb(anstyle::RgbColor(232, 104, 134));
    clap::builder::Styles::styled()
        .header(anstyle::Style::new().bold().underline().fg_color(Some(yellow)))
        .literal(anstyle::Style::new().bold().fg_color(Some(green)))
        .invalid(anstyle::Style::new().bold().fg_color(Some(green)))
        .valid(anstyle::Style::new().bold().fg_color(Some(green)))
        .usage(anstyle::Style::new().bold().fg_color(Some(yellow)))
        .error(anstyle::Style::new().bold().fg_color(Some(red)))
}
