#[cfg(linux)]
mod corefile;
#[cfg(linux)]
mod file;
#[cfg(linux)]
mod live;
