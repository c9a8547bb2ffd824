//! Canonical forms for provider location strings
//!
//! Providers describe Chinese locations in many shapes ("广东·深圳·电信",
//! "腾讯云·广东深圳", "电信"). Everything here is a pure function over strings;
//! the keyword tables are plain data so they can be reviewed and extended
//! without touching the logic.

use crate::models::UNKNOWN_LOCATION;

/// Canonical domestic value when only a carrier was named
pub const CHINA_LOCATION: &str = "中国";

/// Canonical domestic value for datacenter/cloud addresses without a province
pub const DATACENTER_LOCATION: &str = "机房";

/// Global values classified as China (compared case-insensitively)
pub const CHINA_GLOBAL_TOKENS: &[&str] = &["china", "cn", "中国"];

/// Carrier names stripped from domestic locations, longest first
pub const CARRIER_KEYWORDS: &[&str] = &[
    "中国电信",
    "中国联通",
    "中国移动",
    "中国铁通",
    "中国广电",
    "长城宽带",
    "方正宽带",
    "歌华有线",
    "天威视讯",
    "电信通",
    "鹏博士",
    "教育网",
    "电信",
    "联通",
    "移动",
    "铁通",
    "广电",
    "华数",
];

/// Cloud and datacenter markers. Matching is done on the lowercased string.
pub const DATACENTER_KEYWORDS: &[&str] = &[
    "阿里云",
    "腾讯云",
    "华为云",
    "百度云",
    "金山云",
    "京东云",
    "天翼云",
    "移动云",
    "联通云",
    "七牛云",
    "青云",
    "ucloud",
    "亚马逊",
    "aws",
    "azure",
    "谷歌云",
    "数据中心",
    "idc",
    "机房",
];

/// Province-level regions, used to pull a location out of datacenter labels
pub const PROVINCES: &[&str] = &[
    "北京", "天津", "上海", "重庆", "河北", "山西", "辽宁", "吉林", "黑龙江", "江苏", "浙江",
    "安徽", "福建", "江西", "山东", "河南", "湖北", "湖南", "广东", "海南", "四川", "贵州",
    "云南", "陕西", "甘肃", "青海", "台湾", "内蒙古", "广西", "西藏", "宁夏", "新疆", "香港",
    "澳门",
];

/// Administrative suffixes removed before comparing place names, longest first
pub const ADMINISTRATIVE_SUFFIXES: &[&str] = &[
    "维吾尔自治区",
    "回族自治区",
    "壮族自治区",
    "特别行政区",
    "自治区",
    "地区",
    "省",
    "市",
    "盟",
    "州",
    "县",
    "区",
];

const SEPARATORS: &[char] = &['·', ' ', '-', '|', '/', '\t'];

/// Whether a global location names China
pub fn is_china_global(global: &str) -> bool {
    let trimmed = global.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed == CHINA_LOCATION {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    CHINA_GLOBAL_TOKENS.iter().any(|token| lowered == *token)
}

/// Canonicalize a (domestic, global) pair.
///
/// Non-China pairs pass through untouched. For China, carrier names are removed;
/// datacenter labels collapse to their embedded province or to [`DATACENTER_LOCATION`];
/// a carrier-only domestic string becomes [`CHINA_LOCATION`].
pub fn normalize_location(domestic: &str, global: &str) -> (String, String) {
    if !is_china_global(global) {
        return (domestic.to_string(), global.to_string());
    }

    let trimmed = domestic.trim();
    if trimmed.is_empty() || trimmed == UNKNOWN_LOCATION {
        return (domestic.to_string(), global.to_string());
    }

    let normalized = if is_datacenter(trimmed) {
        datacenter_location(trimmed)
    } else {
        let stripped = strip_carriers(trimmed);
        // "阿里电信云" only reveals the provider once the carrier is gone
        if is_datacenter(&stripped) {
            datacenter_location(&stripped)
        } else {
            stripped
        }
    };

    (normalized, global.to_string())
}

fn is_datacenter(domestic: &str) -> bool {
    let lowered = domestic.to_lowercase();
    DATACENTER_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Province embedded in a datacenter label, once provider names are removed.
///
/// Provider names go first so that a name such as "腾讯云南京" is not read as "云南".
fn datacenter_location(domestic: &str) -> String {
    let mut lowered = domestic.to_lowercase();
    lowered.retain(|c| !SEPARATORS.contains(&c));
    let remainder = remove_keywords(&lowered, &[DATACENTER_KEYWORDS, CARRIER_KEYWORDS]);

    earliest_province(&remainder)
        .unwrap_or(DATACENTER_LOCATION)
        .to_string()
}

fn earliest_province(value: &str) -> Option<&'static str> {
    PROVINCES
        .iter()
        .filter_map(|province| value.find(province).map(|pos| (pos, *province)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, province)| province)
}

fn strip_carriers(domestic: &str) -> String {
    let parts: Vec<String> = domestic
        .split(SEPARATORS)
        .map(|part| remove_keywords(part, &[CARRIER_KEYWORDS]))
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        return CHINA_LOCATION.to_string();
    }

    parts.join("·")
}

/// Remove every keyword until none is left, so the result is a fixed point
fn remove_keywords(value: &str, tables: &[&[&str]]) -> String {
    let mut current = value.to_string();
    loop {
        let mut next = current.clone();
        for keyword in tables.iter().flat_map(|table| table.iter()) {
            next = next.replace(keyword, "");
        }
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Comparable key for place names: separators removed, lowercased, one
/// administrative suffix stripped. Unknown or empty input yields an empty key,
/// and so does a bare suffix. Stripping never leaves a single-character name, so
/// "广州" stays whole instead of becoming "广".
pub fn location_match_key(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == UNKNOWN_LOCATION {
        return String::new();
    }

    let mut clean: String = trimmed
        .chars()
        .filter(|c| !SEPARATORS.contains(c))
        .collect::<String>()
        .to_lowercase();

    if let Some(suffix) = ADMINISTRATIVE_SUFFIXES
        .iter()
        .find(|suffix| clean.ends_with(*suffix))
    {
        let stem_len = clean.len() - suffix.len();
        if stem_len == 0 {
            return String::new();
        }
        if clean[..stem_len].chars().count() >= 2 {
            clean.truncate(stem_len);
        }
    }

    clean
}
