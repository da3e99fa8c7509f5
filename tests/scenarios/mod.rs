mod decisions;
mod lifecycle;
mod scan;
